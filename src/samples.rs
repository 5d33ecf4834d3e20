//! Sample work items and jobs.
//!
//! Used by the `mpwork` binary, the integration tests and the benchmarks.
//! Every job here is registered by [`registry`], so the binary can host
//! worker processes for any of them.

use crate::error::CallbackError;
use crate::job::{Job, JobRegistry};
use crate::logging::{LogArgs, LogConfig, LoggerInit, WorkLogger, parse_level};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// A work item carrying one integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleItem {
    pub id: u64,
    pub value: i64,
    /// Sleep this long before working (`slow_square`).
    #[serde(default)]
    pub delay_ms: u64,
    /// Calls to `crash_first` that panic in each process before it behaves.
    #[serde(default)]
    pub crash_first: u32,
    /// `exit_on_flag` ends the whole worker process on this item.
    #[serde(default)]
    pub exit_process: bool,
    /// Written by callbacks that want to leave a trace on the item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SampleItem {
    pub fn new(id: u64, value: i64) -> Self {
        Self {
            id,
            value,
            delay_ms: 0,
            crash_first: 0,
            exit_process: false,
            note: None,
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_crash_first(mut self, crash_first: u32) -> Self {
        self.crash_first = crash_first;
        self
    }

    pub fn with_exit_process(mut self) -> Self {
        self.exit_process = true;
        self
    }
}

/// `count` items with ids and values `1..=count`.
pub fn make_items(count: u64) -> Vec<SampleItem> {
    (1..=count)
        .map(|i| SampleItem::new(i, i as i64))
        .collect()
}

fn square_value(item: &mut SampleItem) -> Result<(), CallbackError> {
    item.value = item
        .value
        .checked_mul(item.value)
        .ok_or_else(|| CallbackError::new(format!("item {}: square overflows", item.id)))?;
    Ok(())
}

pub fn square(item: &mut SampleItem) -> Result<(), CallbackError> {
    square_value(item)
}

pub fn square_logged(item: &mut SampleItem, logger: &WorkLogger) -> Result<(), CallbackError> {
    logger.debug(format_args!("squaring item {} ({})", item.id, item.value));
    square_value(item)?;
    logger.info(format_args!("item {} -> {}", item.id, item.value));
    Ok(())
}

pub fn always_fail(item: &mut SampleItem) -> Result<(), CallbackError> {
    item.note = Some("rejected".to_string());
    Err(CallbackError::new(format!("item {} rejected", item.id)))
}

static CRASH_CALLS: AtomicU32 = AtomicU32::new(0);

pub fn crash_first(item: &mut SampleItem) -> Result<(), CallbackError> {
    let call = CRASH_CALLS.fetch_add(1, Ordering::SeqCst);
    if call < item.crash_first {
        panic!("item {}: deliberate crash {} of {}", item.id, call + 1, item.crash_first);
    }
    square_value(item)
}

pub fn slow_square(item: &mut SampleItem) -> Result<(), CallbackError> {
    if item.delay_ms > 0 {
        std::thread::sleep(Duration::from_millis(item.delay_ms));
    }
    square_value(item)
}

/// Exit code of a worker process ended by `exit_on_flag`.
pub const EXIT_ON_FLAG_CODE: i32 = 3;

/// Like `slow_square`, but a flagged item ends the process it runs in.
/// Never run flagged items inline: the process is the caller's.
pub fn exit_on_flag(item: &mut SampleItem) -> Result<(), CallbackError> {
    if item.delay_ms > 0 {
        std::thread::sleep(Duration::from_millis(item.delay_ms));
    }
    if item.exit_process {
        std::process::exit(EXIT_ON_FLAG_CODE);
    }
    square_value(item)
}

/// Logger initializer for `square_logged`: takes `level` from the arguments.
pub fn configure_logging(config: &mut LogConfig, args: &LogArgs) {
    if let Some(level) = args
        .get("level")
        .and_then(|v| v.as_str())
        .and_then(parse_level)
    {
        config.level = level;
    }
    config.show_thread_names = true;
}

pub fn square_job() -> Job<SampleItem> {
    Job::new("square", square)
}

pub fn square_logged_job() -> Job<SampleItem> {
    Job::with_logger("square_logged", square_logged)
        .with_logger_init(LoggerInit::WithArgs(configure_logging))
}

pub fn always_fail_job() -> Job<SampleItem> {
    Job::new("always_fail", always_fail)
}

pub fn crash_first_job() -> Job<SampleItem> {
    Job::new("crash_first", crash_first)
}

pub fn slow_square_job() -> Job<SampleItem> {
    Job::new("slow_square", slow_square)
}

pub fn exit_on_flag_job() -> Job<SampleItem> {
    Job::new("exit_on_flag", exit_on_flag)
}

/// All sample jobs.
pub fn jobs() -> Vec<Job<SampleItem>> {
    vec![
        square_job(),
        square_logged_job(),
        always_fail_job(),
        crash_first_job(),
        slow_square_job(),
        exit_on_flag_job(),
    ]
}

/// Look a sample job up by name.
pub fn job(name: &str) -> Option<Job<SampleItem>> {
    jobs().into_iter().find(|j| j.name() == name)
}

/// Registry with every sample job.
pub fn registry() -> JobRegistry {
    jobs()
        .into_iter()
        .fold(JobRegistry::new(), |registry, job| registry.with(job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn test_make_items() {
        let items = make_items(3);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], SampleItem::new(1, 1));
        assert_eq!(items[2].value, 3);
    }

    #[test]
    fn test_square_and_overflow() {
        let mut item = SampleItem::new(1, 12);
        square(&mut item).unwrap();
        assert_eq!(item.value, 144);

        let mut big = SampleItem::new(2, i64::MAX);
        let err = square(&mut big).unwrap_err();
        assert!(err.message().contains("overflows"));
    }

    #[test]
    fn test_always_fail_leaves_note() {
        let mut item = SampleItem::new(4, 2);
        assert!(always_fail(&mut item).is_err());
        assert_eq!(item.note.as_deref(), Some("rejected"));
        assert_eq!(item.value, 2);
    }

    #[test]
    fn test_slow_square() {
        let mut item = SampleItem::new(1, 3).with_delay(5);
        slow_square(&mut item).unwrap();
        assert_eq!(item.value, 9);
    }

    #[test]
    fn test_exit_on_flag_squares_unflagged_items() {
        let mut item = SampleItem::new(1, 7);
        exit_on_flag(&mut item).unwrap();
        assert_eq!(item.value, 49);
        assert!(SampleItem::new(2, 1).with_exit_process().exit_process);
    }

    #[test]
    fn test_configure_logging_reads_level() {
        let mut config = LogConfig::for_work_items();
        let mut args = LogArgs::new();
        args.insert("level".into(), "debug".into());
        configure_logging(&mut config, &args);
        assert_eq!(config.level, Level::DEBUG);

        args.insert("level".into(), "nonsense".into());
        configure_logging(&mut config, &args);
        assert_eq!(config.level, Level::DEBUG);
    }

    #[test]
    fn test_registry_holds_all_jobs() {
        let registry = registry();
        assert_eq!(
            registry.names(),
            vec![
                "always_fail",
                "crash_first",
                "exit_on_flag",
                "slow_square",
                "square",
                "square_logged"
            ]
        );
        assert!(job("square_logged").unwrap().takes_logger());
        assert!(job("missing").is_none());
    }

    #[test]
    fn test_item_wire_format_defaults() {
        let item: SampleItem = serde_json::from_str(r#"{"id":1,"value":5}"#).unwrap();
        assert_eq!(item, SampleItem::new(1, 5));
        let json = serde_json::to_string(&item).unwrap();
        assert!(!json.contains("note"));
    }
}
