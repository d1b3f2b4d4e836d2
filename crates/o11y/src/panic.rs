use once_cell::sync::OnceCell;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::{panic, thread};
use tracing::{error, info};

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Install a panic hook that reports panics through tracing, so a worker
/// task dying mid-ingest shows up in the structured log stream with the
/// object type fields of any enclosing span.
pub fn install_hook() {
    if INSTALLED.set(()).is_err() {
        return;
    }

    let prev = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let thread = thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");
        let message = panic_message(panic_info.payload());

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "<unknown>".into());

        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            error!(thread = %thread_name, %location, %message, %backtrace, "panic");
        } else {
            error!(thread = %thread_name, %location, %message, "panic");
        }

        prev(panic_info);
    }));

    info!("panic hook installed");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_string_payloads() {
        let a: Box<dyn std::any::Any + Send> = Box::new("static");
        let b: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let c: Box<dyn std::any::Any + Send> = Box::new(42u32);

        assert_eq!(panic_message(a.as_ref()), "static");
        assert_eq!(panic_message(b.as_ref()), "owned");
        assert_eq!(panic_message(c.as_ref()), "<non-string panic payload>");
    }

    #[test]
    fn install_is_idempotent() {
        install_hook();
        install_hook();
        assert!(INSTALLED.get().is_some());
    }
}
