use jni::objects::{JClass, JObject, JString};
use jni::sys::{jboolean, jint, jintArray, jlong, jstring, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use log::{debug, info};

use super::{
    bridge, ffi_guard, if_valid_handle, last_error, parse_handle, read_history, read_string, token_budget,
    JavaChunkCallback,
};

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeCreate<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    config_path: JString<'local>,
) -> jlong {
    ffi_guard(&mut env, "nativeCreate", 0, |env| {
        let path = read_string(env, &config_path)?;
        let handle = bridge()?.create(&path)?;
        Ok(handle.as_raw())
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeLoad<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) -> jboolean {
    ffi_guard(&mut env, "nativeLoad", JNI_FALSE, |_| {
        bridge()?.load(parse_handle(handle)?)?;
        Ok(JNI_TRUE)
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeRelease<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) {
    ffi_guard(&mut env, "nativeRelease", (), |_| {
        if_valid_handle(handle, |h| {
            if !bridge()?.destroy(h) {
                debug!("nativeRelease: handle {} was already released", h);
            }
            Ok(())
        })
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeTokenize<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
    text: JString<'local>,
) -> jintArray {
    ffi_guard(&mut env, "nativeTokenize", std::ptr::null_mut(), |env| {
        let handle = parse_handle(handle)?;
        let text = read_string(env, &text)?;
        let tokens = bridge()?.tokenize(handle, &text)?;

        let array = env.new_int_array(i32::try_from(tokens.len())?)?;
        env.set_int_array_region(&array, 0, &tokens)?;
        Ok(array.into_raw())
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeDetokenize<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
    token: jint,
) -> jstring {
    ffi_guard(&mut env, "nativeDetokenize", std::ptr::null_mut(), |env| {
        let text = bridge()?.detokenize(parse_handle(handle)?, token)?;
        Ok(env.new_string(text)?.into_raw())
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeGenerate<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
    prompt: JString<'local>,
    max_tokens: jint,
) -> jstring {
    ffi_guard(&mut env, "nativeGenerate", std::ptr::null_mut(), |env| {
        let handle = parse_handle(handle)?;
        let prompt = read_string(env, &prompt)?;
        let text = bridge()?.generate_blocking(handle, &prompt, token_budget(max_tokens))?;
        Ok(env.new_string(text)?.into_raw())
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeGenerateStream<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
    history: JObject<'local>,
    max_tokens: jint,
    callback: JObject<'local>,
) -> jboolean {
    ffi_guard(&mut env, "nativeGenerateStream", JNI_FALSE, |env| {
        let handle = parse_handle(handle)?;
        let turns = read_history(env, &history)?;
        let callback = JavaChunkCallback::new(env, &callback)?;

        let outcome = bridge()?.generate_stream(handle, &turns, token_budget(max_tokens), |chunk| {
            callback.deliver(chunk)
        })?;
        info!(
            "nativeGenerateStream on {}: {:?}, {} chunks",
            handle, outcome.stop_reason, outcome.chunks
        );
        Ok(JNI_TRUE)
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeCancel<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) {
    ffi_guard(&mut env, "nativeCancel", (), |_| {
        if_valid_handle(handle, |h| {
            bridge()?.cancel(h);
            Ok(())
        })
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeApplyChatTemplate<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
    user_content: JString<'local>,
) -> jstring {
    ffi_guard(&mut env, "nativeApplyChatTemplate", std::ptr::null_mut(), |env| {
        let handle = parse_handle(handle)?;
        let content = read_string(env, &user_content)?;
        let rendered = bridge()?.apply_chat_template(handle, &content)?;
        Ok(env.new_string(rendered)?.into_raw())
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeSetConfig<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
    json: JString<'local>,
) -> jboolean {
    ffi_guard(&mut env, "nativeSetConfig", JNI_FALSE, |env| {
        let handle = parse_handle(handle)?;
        let json = read_string(env, &json)?;
        bridge()?.set_config(handle, &json)?;
        Ok(JNI_TRUE)
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeReset<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jlong,
) {
    ffi_guard(&mut env, "nativeReset", (), |_| bridge()?.reset(parse_handle(handle)?))
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeGetLastError<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jstring {
    ffi_guard(&mut env, "nativeGetLastError", std::ptr::null_mut(), |env| match last_error() {
        Some(msg) => Ok(env.new_string(msg)?.into_raw()),
        None => Ok(std::ptr::null_mut()),
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_LlmNative_nativeVersion<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jstring {
    ffi_guard(&mut env, "nativeVersion", std::ptr::null_mut(), |env| {
        Ok(env.new_string(env!("CARGO_PKG_VERSION"))?.into_raw())
    })
}
