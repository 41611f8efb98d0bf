use anyhow::anyhow;
use jni::objects::{JClass, JFloatArray, JIntArray, JLongArray, JObjectArray, JString};
use jni::sys::{jboolean, jfloatArray, jint, jintArray, jlong, jlongArray, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use log::debug;

use common::{DataType, DimensionFormat, ForwardType, MemoryMode, ModuleConfig, Precision};

use super::{bridge, ffi_guard, if_valid_handle, parse_handle, read_string, read_string_array};
use crate::handle::Handle;
use crate::llm_engine::ModuleSpec;

fn read_ints(env: &mut JNIEnv, array: &JIntArray) -> anyhow::Result<Vec<i32>> {
    if array.is_null() {
        return Ok(Vec::new());
    }
    let mut out = vec![0; env.get_array_length(array)?.max(0) as usize];
    env.get_int_array_region(array, 0, &mut out)?;
    Ok(out)
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_TensorNative_nativeCreateModule<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    path: JString<'local>,
    inputs: JObjectArray<'local>,
    outputs: JObjectArray<'local>,
    forward_type: jint,
    num_thread: jint,
    precision: jint,
    memory_mode: jint,
) -> jlong {
    ffi_guard(&mut env, "nativeCreateModule", 0, |env| {
        let path = read_string(env, &path)?;
        let spec = ModuleSpec {
            inputs: read_string_array(env, &inputs)?,
            outputs: read_string_array(env, &outputs)?,
            config: ModuleConfig {
                forward_type: ForwardType::from_raw(forward_type),
                num_threads: u32::try_from(num_thread).unwrap_or(0),
                precision: Precision::from_raw(precision),
                memory: MemoryMode::from_raw(memory_mode),
            },
        };
        Ok(bridge()?.create_module(&path, &spec)?.as_raw())
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_TensorNative_nativeReleaseModule<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    module: jlong,
) {
    ffi_guard(&mut env, "nativeReleaseModule", (), |_| {
        if_valid_handle(module, |h| {
            if !bridge()?.release_module(h) {
                debug!("nativeReleaseModule: module {} was already released", h);
            }
            Ok(())
        })
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_TensorNative_nativeForward<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    module: jlong,
    inputs: JLongArray<'local>,
) -> jlongArray {
    ffi_guard(&mut env, "nativeForward", std::ptr::null_mut(), |env| {
        let module = parse_handle(module)?;
        if inputs.is_null() {
            return Err(anyhow!("input array is null"));
        }
        let mut raw = vec![0i64; env.get_array_length(&inputs)?.max(0) as usize];
        env.get_long_array_region(&inputs, 0, &mut raw)?;
        // zero entries stand for absent inputs
        let handles: Vec<Handle> = raw.into_iter().filter_map(Handle::from_raw).collect();

        let outputs: Vec<i64> = bridge()?
            .forward(module, &handles)?
            .into_iter()
            .map(Handle::as_raw)
            .collect();
        let array = env.new_long_array(i32::try_from(outputs.len())?)?;
        env.set_long_array_region(&array, 0, &outputs)?;
        Ok(array.into_raw())
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_TensorNative_nativeCreateTensor<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    shape: JIntArray<'local>,
    format: jint,
    dtype: jint,
) -> jlong {
    ffi_guard(&mut env, "nativeCreateTensor", 0, |env| {
        let shape = read_ints(env, &shape)?;
        let format = DimensionFormat::from_raw(format).ok_or_else(|| anyhow!("unknown dimension format {}", format))?;
        let dtype = DataType::from_raw(dtype).ok_or_else(|| anyhow!("unsupported data type {:#x}", dtype))?;
        Ok(bridge()?.create_tensor(shape, format, dtype)?.as_raw())
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_TensorNative_nativeSetFloatData<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    tensor: jlong,
    data: JFloatArray<'local>,
) -> jboolean {
    ffi_guard(&mut env, "nativeSetFloatData", JNI_FALSE, |env| {
        let tensor = parse_handle(tensor)?;
        if data.is_null() {
            return Err(anyhow!("data array is null"));
        }
        let mut values = vec![0f32; env.get_array_length(&data)?.max(0) as usize];
        env.get_float_array_region(&data, 0, &mut values)?;
        bridge()?.set_float_data(tensor, &values)?;
        Ok(JNI_TRUE)
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_TensorNative_nativeSetIntData<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    tensor: jlong,
    data: JIntArray<'local>,
) -> jboolean {
    ffi_guard(&mut env, "nativeSetIntData", JNI_FALSE, |env| {
        let tensor = parse_handle(tensor)?;
        if data.is_null() {
            return Err(anyhow!("data array is null"));
        }
        let values = read_ints(env, &data)?;
        bridge()?.set_int_data(tensor, &values)?;
        Ok(JNI_TRUE)
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_TensorNative_nativeGetFloatData<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    tensor: jlong,
) -> jfloatArray {
    ffi_guard(&mut env, "nativeGetFloatData", std::ptr::null_mut(), |env| {
        let values = bridge()?.get_float_data(parse_handle(tensor)?)?;
        let array = env.new_float_array(i32::try_from(values.len())?)?;
        env.set_float_array_region(&array, 0, &values)?;
        Ok(array.into_raw())
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_TensorNative_nativeGetShape<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    tensor: jlong,
) -> jintArray {
    ffi_guard(&mut env, "nativeGetShape", std::ptr::null_mut(), |env| {
        let shape = bridge()?.get_shape(parse_handle(tensor)?)?;
        let array = env.new_int_array(i32::try_from(shape.len())?)?;
        env.set_int_array_region(&array, 0, &shape)?;
        Ok(array.into_raw())
    })
}

#[no_mangle]
pub extern "C" fn Java_com_gpuf_bridge_TensorNative_nativeReleaseTensor<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    tensor: jlong,
) {
    ffi_guard(&mut env, "nativeReleaseTensor", (), |_| {
        if_valid_handle(tensor, |h| {
            bridge()?.release_tensor(h);
            Ok(())
        })
    })
}
