//! C ABI.
//!
//! Handles are opaque pointers to a boxed model plus the prompt context the library keeps on
//! the caller's behalf. `llmodel_prompt` copies the caller's parameters in, runs the prompt, and
//! points the caller's `tokens`/`logits` at the library-owned history. Those pointers are valid
//! until the next call on the same handle. `logits` points at the newest row only.
//!
//! Callers must serialize calls per handle and must not use a handle after destroying it.

#![allow(non_snake_case)]

use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;

use tracing::{debug, error, warn};

use crate::context::PromptContext;
use crate::model::{Backend, Model, Token, Variant};

pub type LLModel = *mut c_void;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct LLModelPromptContext {
    pub logits: *mut f32,
    pub tokens: *mut i32,
    pub n_past: i32,
    pub n_ctx: i32,
    pub n_predict: i32,
    pub top_k: i32,
    pub top_p: f32,
    pub temp: f32,
    pub n_batch: i32,
    pub repeat_penalty: f32,
    pub repeat_last_n: i32,
    pub context_erase: f32,
}

impl Default for LLModelPromptContext {
    fn default() -> Self {
        let d = PromptContext::default();
        Self {
            logits: ptr::null_mut(),
            tokens: ptr::null_mut(),
            n_past: 0,
            n_ctx: clamp_i32(d.n_ctx),
            n_predict: clamp_i32(d.n_predict),
            top_k: clamp_i32(d.top_k),
            top_p: d.top_p,
            temp: d.temp,
            n_batch: clamp_i32(d.n_batch),
            repeat_penalty: d.repeat_penalty,
            repeat_last_n: clamp_i32(d.repeat_last_n),
            context_erase: d.context_erase,
        }
    }
}

pub type LLModelResponseCallback =
    Option<unsafe extern "C" fn(token_id: i32, response: *const c_char) -> bool>;
pub type LLModelRecalculateCallback = Option<unsafe extern "C" fn(is_recalculating: bool) -> bool>;

struct Handle {
    model: Model,
    context: PromptContext,
}

fn clamp_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn create(variant: Variant) -> LLModel {
    let handle = Box::new(Handle { model: Model::new(variant), context: PromptContext::default() });
    Box::into_raw(handle).cast()
}

unsafe fn destroy(model: LLModel) {
    if !model.is_null() {
        drop(Box::from_raw(model.cast::<Handle>()));
    }
}

unsafe fn handle<'a>(model: LLModel) -> Option<&'a mut Handle> {
    let handle = model.cast::<Handle>().as_mut();
    if handle.is_none() {
        warn!("null model handle");
    }
    handle
}

/// Create a GPT-J instance.
#[no_mangle]
pub extern "C" fn llmodel_gptj_create() -> LLModel {
    create(Variant::GptJ)
}

/// # Safety
/// `gptj` must come from `llmodel_gptj_create` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn llmodel_gptj_destroy(gptj: LLModel) {
    destroy(gptj)
}

/// Create a LLaMA instance.
#[no_mangle]
pub extern "C" fn llmodel_llama_create() -> LLModel {
    create(Variant::Llama)
}

/// # Safety
/// `llama` must come from `llmodel_llama_create` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn llmodel_llama_destroy(llama: LLModel) {
    destroy(llama)
}

/// Create an instance by variant name; null for unknown names.
///
/// # Safety
/// `name` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llmodel_model_create(name: *const c_char) -> LLModel {
    if name.is_null() {
        return ptr::null_mut();
    }
    match CStr::from_ptr(name).to_string_lossy().parse::<Variant>() {
        Ok(variant) => create(variant),
        Err(e) => {
            warn!(error = %e, "cannot create model");
            ptr::null_mut()
        }
    }
}

/// # Safety
/// `model` must come from one of the create functions and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn llmodel_model_destroy(model: LLModel) {
    destroy(model)
}

/// # Safety
/// `model` must be a live handle, `model_path` null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llmodel_loadModel(model: LLModel, model_path: *const c_char) -> bool {
    let Some(handle) = handle(model) else { return false };
    if model_path.is_null() {
        return false;
    }
    let path = CStr::from_ptr(model_path).to_string_lossy().into_owned();
    handle.model.load(path)
}

/// # Safety
/// `model` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn llmodel_isModelLoaded(model: LLModel) -> bool {
    handle(model).is_some_and(|h| h.model.is_loaded())
}

/// # Safety
/// `model` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn llmodel_setThreadCount(model: LLModel, n_threads: i32) {
    if let Some(handle) = handle(model) {
        handle.model.set_thread_count(usize::try_from(n_threads).unwrap_or(1));
    }
}

/// # Safety
/// `model` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn llmodel_threadCount(model: LLModel) -> i32 {
    handle(model).map_or(0, |h| clamp_i32(h.model.thread_count()))
}

/// Generate a response for `prompt`, streaming tokens to `response`.
///
/// # Safety
/// `model` must be a live handle, `prompt` a NUL-terminated string, `ctx` a valid pointer.
/// The callbacks may be null, meaning "always continue".
#[no_mangle]
pub unsafe extern "C" fn llmodel_prompt(
    model: LLModel,
    prompt: *const c_char,
    response: LLModelResponseCallback,
    recalculate: LLModelRecalculateCallback,
    ctx: *mut LLModelPromptContext,
) {
    let Some(handle) = handle(model) else { return };
    let Some(ctx) = ctx.as_mut() else {
        warn!("null prompt context");
        return;
    };
    if prompt.is_null() {
        warn!("null prompt");
        return;
    }
    let prompt = CStr::from_ptr(prompt).to_string_lossy();
    prompt_c(&mut handle.model, &mut handle.context, &prompt, response, recalculate, ctx);
}

/// Run one prompt on behalf of a C caller: read parameters from `c`, generate, write back.
fn prompt_c<B: Backend>(
    model: &mut Model<B>,
    context: &mut PromptContext,
    prompt: &str,
    response: LLModelResponseCallback,
    recalculate: LLModelRecalculateCallback,
    c: &mut LLModelPromptContext,
) {
    if let Err(msg) = read_params(c, context) {
        error!(%msg, "rejected prompt context");
        write_back(context, c);
        return;
    }

    let on_response = |token: Token, text: &str| match response {
        Some(cb) => {
            // interior NULs would truncate the string on the C side
            let text = CString::new(text.replace('\0', "")).unwrap_or_default();
            // SAFETY: the caller guarantees the callback is valid for this call.
            unsafe { cb(token, text.as_ptr()) }
        }
        None => true,
    };
    let on_recalculate = |is_recalculating: bool| match recalculate {
        // SAFETY: as above.
        Some(cb) => unsafe { cb(is_recalculating) },
        None => true,
    };

    match model.prompt(prompt, context, on_response, on_recalculate) {
        Ok(outcome) => debug!(?outcome, n_past = context.n_past(), "prompt finished"),
        Err(e) => error!(error = %e, "prompt failed"),
    }
    write_back(context, c);
}

fn read_params(c: &LLModelPromptContext, ctx: &mut PromptContext) -> Result<(), String> {
    let count = |name: &str, v: i32| usize::try_from(v).map_err(|_| format!("{name} is negative ({v})"));
    let n_past = count("n_past", c.n_past)?;
    ctx.n_ctx = count("n_ctx", c.n_ctx)?;
    ctx.n_predict = count("n_predict", c.n_predict)?;
    ctx.top_k = count("top_k", c.top_k)?;
    ctx.top_p = c.top_p;
    ctx.temp = c.temp;
    ctx.n_batch = count("n_batch", c.n_batch)?;
    ctx.repeat_penalty = c.repeat_penalty;
    ctx.repeat_last_n = count("repeat_last_n", c.repeat_last_n)?;
    ctx.context_erase = c.context_erase;

    // lowering n_past rewinds the conversation; 0 starts a new one
    if n_past < ctx.n_past() {
        ctx.truncate(n_past);
    } else if n_past > ctx.n_past() {
        warn!(requested = n_past, held = ctx.n_past(), "n_past beyond the held history, ignoring");
    }
    Ok(())
}

fn write_back(ctx: &PromptContext, c: &mut LLModelPromptContext) {
    c.n_past = clamp_i32(ctx.n_past());
    c.tokens = if ctx.tokens().is_empty() {
        ptr::null_mut()
    } else {
        ctx.tokens().as_ptr().cast_mut()
    };
    c.logits = ctx.last_logits().map_or(ptr::null_mut(), |row| row.as_ptr().cast_mut());
}
