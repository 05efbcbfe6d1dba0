// Native functions backing the prelude builtins

use super::sanitize;
use super::BoundaryEvent;
use crate::error::ErrorKind;
use crate::protocol::{BoundaryMessage, LogLevel};
use base64::Engine as _;
use rquickjs::{Ctx, Exception, Function, Object, Value};
use serde_json::Value as Json;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

/// Events produced inside the engine, drained by whoever drives the boundary
#[derive(Default)]
pub(crate) struct Outbox {
    events: RefCell<Vec<BoundaryEvent>>,
    next_timer: Cell<u32>,
}

impl Outbox {
    pub fn push(&self, event: BoundaryEvent) {
        self.events.borrow_mut().push(event);
    }

    pub fn post(&self, message: BoundaryMessage) {
        self.push(BoundaryEvent::Message(message));
    }

    pub fn take(&self) -> Vec<BoundaryEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    fn next_timer_id(&self) -> u32 {
        let id = self.next_timer.get().wrapping_add(1).max(1);
        self.next_timer.set(id);
        id
    }
}

/// Build the `native` object handed to the prelude factory
pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    outbox: Rc<Outbox>,
    depth: usize,
) -> rquickjs::Result<Object<'js>> {
    let native = Object::new(ctx.clone())?;

    let out = outbox.clone();
    native.set(
        "console",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, level: String, args: Value<'js>| {
            out.post(BoundaryMessage::Console {
                level: parse_level(&level),
                args: to_args(&ctx, &args, depth),
            });
        })?,
    )?;

    let out = outbox.clone();
    native.set(
        "log",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, level: String, args: Value<'js>, logger: Option<String>| {
                out.post(BoundaryMessage::Log {
                    level: parse_level(&level),
                    args: to_args(&ctx, &args, depth),
                    logger,
                });
            },
        )?,
    )?;

    let out = outbox.clone();
    native.set(
        "schedule",
        Function::new(ctx.clone(), move |delay_ms: f64| -> u32 {
            let id = out.next_timer_id();
            let delay = if delay_ms.is_finite() && delay_ms > 0.0 {
                Duration::from_millis(delay_ms as u64)
            } else {
                Duration::ZERO
            };
            out.push(BoundaryEvent::ScheduleTimer { id, delay });
            id
        })?,
    )?;

    let out = outbox.clone();
    native.set(
        "cancel",
        Function::new(ctx.clone(), move |id: u32| {
            out.push(BoundaryEvent::CancelTimer { id });
        })?,
    )?;

    let out = outbox.clone();
    native.set(
        "request",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, url: String, options: Value<'js>| -> rquickjs::Result<String> {
                let options = sanitize::to_json(&ctx, &options, depth)?;
                let id = uuid::Uuid::new_v4().to_string();
                out.post(BoundaryMessage::NetworkRequest {
                    id: id.clone(),
                    url,
                    options,
                });
                Ok(id)
            },
        )?,
    )?;

    let out = outbox.clone();
    native.set(
        "settle",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, request_id: String, result: Value<'js>| {
                let message = match sanitize::to_json(&ctx, &result, depth) {
                    Ok(result) => BoundaryMessage::Result { request_id, result },
                    Err(e) => BoundaryMessage::error(
                        Some(request_id),
                        ErrorKind::Invocation,
                        format!("Result could not be converted: {e}"),
                        None,
                    ),
                };
                out.post(message);
            },
        )?,
    )?;

    let out = outbox;
    native.set(
        "fail",
        Function::new(
            ctx.clone(),
            move |request_id: String,
                  error: String,
                  message: Option<String>,
                  stack: Option<String>| {
                out.post(BoundaryMessage::Error {
                    request_id: Some(request_id),
                    error,
                    stack,
                    message,
                    kind: Some(ErrorKind::Invocation),
                });
            },
        )?,
    )?;

    native.set(
        "btoa",
        Function::new(ctx.clone(), |input: String| -> String {
            base64::engine::general_purpose::STANDARD.encode(input.as_bytes())
        })?,
    )?;

    native.set(
        "atob",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, input: String| -> rquickjs::Result<String> {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(input.trim())
                    .map_err(|e| Exception::throw_message(&ctx, &format!("atob: {e}")))?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            },
        )?,
    )?;

    Ok(native)
}

fn parse_level(level: &str) -> LogLevel {
    level.parse().unwrap_or(LogLevel::Info)
}

/// Console arguments as a JSON list; unconvertible values are stringified
fn to_args<'js>(ctx: &Ctx<'js>, args: &Value<'js>, depth: usize) -> Vec<Json> {
    match sanitize::to_json(ctx, args, depth + 1) {
        Ok(Json::Array(items)) => items,
        Ok(other) => vec![other],
        Err(_) => vec![Json::String(sanitize::display(args))],
    }
}
