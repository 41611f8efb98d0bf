//! JNI exports for `com.gpuf.bridge.LlmNative` and `com.gpuf.bridge.TensorNative`.
//!
//! Each export converts its arguments, calls one [`Bridge`] method and maps
//! the result to the sentinel Java expects (`0`, `null`, `false`). Failures
//! never cross into the JVM: errors and panics are logged, recorded for
//! `nativeGetLastError`, and any pending Java exception is cleared.

mod llm_native;
mod tensor_native;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, OnceLock};

use anyhow::{anyhow, Result};
use jni::objects::{GlobalRef, JObject, JObjectArray, JString, JValue};
use jni::{JNIEnv, JavaVM};
use log::{debug, error, warn};

use common::HistoryTurn;

use crate::bridge::Bridge;
use crate::handle::Handle;
use crate::llm_engine::llama_engine::LlamaEngine;
use crate::stream::DeliveryError;

static BRIDGE: OnceLock<Result<Bridge<LlamaEngine>, String>> = OnceLock::new();

// Global error information storage
static LAST_ERROR: Mutex<Option<String>> = Mutex::new(None);

/// The process-wide bridge, created on first use.
pub(crate) fn bridge() -> Result<&'static Bridge<LlamaEngine>> {
    BRIDGE
        .get_or_init(|| {
            crate::init();
            LlamaEngine::new()
                .map(Bridge::new)
                .map_err(|e| format!("{:#}", e))
        })
        .as_ref()
        .map_err(|e| anyhow!("inference engine unavailable: {}", e))
}

fn set_last_error(err: String) {
    if let Ok(mut last_error) = LAST_ERROR.lock() {
        *last_error = Some(err);
    }
}

pub(crate) fn last_error() -> Option<String> {
    LAST_ERROR.lock().ok().and_then(|e| e.clone())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Describes and clears a pending Java exception. Returns whether one was pending.
pub(crate) fn clear_exception(env: &mut JNIEnv) -> bool {
    match env.exception_check() {
        Ok(true) => {
            let _ = env.exception_describe();
            let _ = env.exception_clear();
            true
        }
        _ => false,
    }
}

/// Runs an export body, turning errors and panics into `fallback`.
pub(crate) fn ffi_guard<'local, T>(
    env: &mut JNIEnv<'local>,
    op: &str,
    fallback: T,
    body: impl FnOnce(&mut JNIEnv<'local>) -> Result<T>,
) -> T {
    let result = panic::catch_unwind(AssertUnwindSafe(|| body(&mut *env)));
    if clear_exception(env) {
        warn!("{}: cleared pending Java exception", op);
    }
    match result {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            let msg = format!("{} failed: {:#}", op, e);
            error!("{}", msg);
            set_last_error(msg);
            fallback
        }
        Err(payload) => {
            let msg = format!("{} panicked: {}", op, panic_message(payload.as_ref()));
            error!("{}", msg);
            set_last_error(msg);
            fallback
        }
    }
}

pub(crate) fn parse_handle(raw: i64) -> Result<Handle> {
    Handle::from_raw(raw).ok_or_else(|| anyhow!("invalid handle {}", raw))
}

/// For void exports where the invalid sentinel simply means there is nothing
/// to do: `op` is skipped and no error is recorded.
pub(crate) fn if_valid_handle(raw: i64, op: impl FnOnce(Handle) -> Result<()>) -> Result<()> {
    match Handle::from_raw(raw) {
        Some(handle) => op(handle),
        None => {
            debug!("Ignoring invalid handle {}", raw);
            Ok(())
        }
    }
}

/// `maxTokens <= 0` means "use the session default".
pub(crate) fn token_budget(max_tokens: i32) -> Option<usize> {
    usize::try_from(max_tokens).ok().filter(|n| *n > 0)
}

/// A null Java string reads as empty.
pub(crate) fn read_string(env: &mut JNIEnv, s: &JString) -> Result<String> {
    if s.is_null() {
        return Ok(String::new());
    }
    Ok(env.get_string(s)?.into())
}

pub(crate) fn read_string_array(env: &mut JNIEnv, array: &JObjectArray) -> Result<Vec<String>> {
    if array.is_null() {
        return Ok(Vec::new());
    }
    let len = env.get_array_length(array)?;
    let mut out = Vec::with_capacity(len.max(0) as usize);
    for i in 0..len {
        let item = JString::from(env.get_object_array_element(array, i)?);
        out.push(read_string(env, &item)?);
        env.delete_local_ref(item)?;
    }
    Ok(out)
}

/// Reads a `List<Pair<String, String>>` of (role, content). Null pairs and
/// pairs with a null side are skipped.
pub(crate) fn read_history(env: &mut JNIEnv, list: &JObject) -> Result<Vec<HistoryTurn>> {
    if list.is_null() {
        return Ok(Vec::new());
    }
    let size = env.call_method(list, "size", "()I", &[])?.i()?;
    let mut turns = Vec::with_capacity(size.max(0) as usize);
    for i in 0..size {
        let pair = env
            .call_method(list, "get", "(I)Ljava/lang/Object;", &[JValue::Int(i)])?
            .l()?;
        if pair.is_null() {
            continue;
        }
        let role = JString::from(env.call_method(&pair, "getFirst", "()Ljava/lang/Object;", &[])?.l()?);
        let content = JString::from(env.call_method(&pair, "getSecond", "()Ljava/lang/Object;", &[])?.l()?);
        if !role.is_null() && !content.is_null() {
            turns.push(HistoryTurn::new(read_string(env, &role)?, read_string(env, &content)?));
        }
        env.delete_local_ref(role)?;
        env.delete_local_ref(content)?;
        env.delete_local_ref(pair)?;
    }
    Ok(turns)
}

const ON_CHUNK: &str = "onChunk";
const ON_CHUNK_SIG: &str = "(Ljava/lang/String;)Z";

/// Java `ChunkCallback` pinned for the length of one streaming request.
///
/// Each delivery attaches the current thread to the JVM. On the usual path the
/// thread is already attached and the attach is a no-op that leaves it
/// attached afterwards.
pub(crate) struct JavaChunkCallback {
    vm: JavaVM,
    callback: GlobalRef,
}

impl JavaChunkCallback {
    pub(crate) fn new(env: &mut JNIEnv, callback: &JObject) -> Result<Self> {
        if callback.is_null() {
            return Err(anyhow!("callback is null"));
        }
        let class = env.get_object_class(callback)?;
        let method = env.get_method_id(&class, ON_CHUNK, ON_CHUNK_SIG);
        env.delete_local_ref(class)?;
        if method.is_err() {
            clear_exception(env);
            return Err(anyhow!("callback has no boolean {}(String) method", ON_CHUNK));
        }

        Ok(Self {
            vm: env.get_java_vm()?,
            callback: env.new_global_ref(callback)?,
        })
    }

    pub(crate) fn deliver(&self, chunk: &str) -> Result<bool, DeliveryError> {
        let mut env = self
            .vm
            .attach_current_thread()
            .map_err(|e| DeliveryError::ContextUnavailable(e.to_string()))?;

        let text = env
            .new_string(chunk)
            .map_err(|e| DeliveryError::Consumer(format!("failed to create chunk string: {}", e)))?;
        let result = env
            .call_method(self.callback.as_obj(), ON_CHUNK, ON_CHUNK_SIG, &[(&text).into()])
            .and_then(|v| v.z());
        let _ = env.delete_local_ref(text);

        result.map_err(|e| {
            clear_exception(&mut env);
            DeliveryError::Consumer(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_budget() {
        assert_eq!(token_budget(0), None);
        assert_eq!(token_budget(-3), None);
        assert_eq!(token_budget(5), Some(5));
    }

    #[test]
    fn test_parse_handle_rejects_sentinel() {
        assert!(parse_handle(0).is_err());
        assert!(parse_handle(-1).is_err());
        assert_eq!(parse_handle(12).unwrap().as_raw(), 12);
    }

    #[test]
    fn test_invalid_handle_is_a_silent_noop() {
        let mut calls = Vec::new();
        if_valid_handle(0, |h| {
            calls.push(h);
            Err(anyhow!("unreachable"))
        })
        .unwrap();
        if_valid_handle(-4, |h| {
            calls.push(h);
            Ok(())
        })
        .unwrap();
        assert!(calls.is_empty());

        if_valid_handle(9, |h| {
            calls.push(h);
            Ok(())
        })
        .unwrap();
        assert_eq!(calls, vec![Handle::from_raw(9).unwrap()]);
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("kaboom {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "kaboom 7");
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }
}
