/// Logs `fmt` under the target `response_agent::<component>`, so the
/// `[target]` column of the log line names the component rather than the
/// module that happened to emit it. `component` must be a string literal.
///
/// ```rust
/// use log::Level;
/// use response_agent::agent_log;
/// agent_log!(Level::Info, "dispatcher", "connected to {}", "http://127.0.0.1:7601");
/// agent_log!(Level::Debug, "tracker", "event {} emitted", 7);
/// ```
/// With the binary's fern format this prints:
/// [2025-04-25T16:32:10+02:00][DEBUG][response_agent::tracker][pid=4568][tid=ThreadId(1)] event 7 emitted
#[macro_export]
macro_rules! agent_log {
    ($level:expr, $component:literal, $fmt:literal $(, $($arg:tt)+)?) => {
        log::log!(
            target: concat!("response_agent::", $component),
            $level,
            $fmt
            $(, $($arg)+)?
        )
    };
}
