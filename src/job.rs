//! Work items and the jobs that run on them.
//!
//! A [`Job`] pairs a name with a plain function over a work item. Worker
//! processes run the same binary as the caller, so they find the function
//! again by looking the name up in a [`JobRegistry`]. Before any process is
//! spawned the caller's job is checked against the installed registry, so a
//! worker never runs anything but the callable it was handed.

use crate::error::{CallbackError, PoolError, Result};
use crate::logging::{LogArgs, LoggerInit, WorkLogger};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Anything that can be shipped to a worker process and back.
pub trait WorkItem: Serialize + DeserializeOwned + Send + 'static {}

impl<T> WorkItem for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// The callable a job runs on each item.
pub enum Callback<T> {
    /// Takes only the item.
    Plain(fn(&mut T) -> std::result::Result<(), CallbackError>),
    /// Takes the item and the process logger.
    WithLogger(fn(&mut T, &WorkLogger) -> std::result::Result<(), CallbackError>),
}

impl<T> Clone for Callback<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Plain(f) => Self::Plain(*f),
            Self::WithLogger(f) => Self::WithLogger(*f),
        }
    }
}

/// A named, typed unit of work applied to every item of a batch.
pub struct Job<T> {
    name: &'static str,
    callback: Callback<T>,
    logger_init: Option<LoggerInit>,
}

impl<T> Clone for Job<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            callback: self.callback.clone(),
            logger_init: self.logger_init,
        }
    }
}

impl<T> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("takes_logger", &self.takes_logger())
            .field("logger_init", &self.logger_init)
            .finish()
    }
}

impl<T> Job<T> {
    /// A job whose callback takes only the item.
    pub fn new(
        name: &'static str,
        callback: fn(&mut T) -> std::result::Result<(), CallbackError>,
    ) -> Self {
        Self {
            name,
            callback: Callback::Plain(callback),
            logger_init: None,
        }
    }

    /// A job whose callback also receives the process logger.
    pub fn with_logger(
        name: &'static str,
        callback: fn(&mut T, &WorkLogger) -> std::result::Result<(), CallbackError>,
    ) -> Self {
        Self {
            name,
            callback: Callback::WithLogger(callback),
            logger_init: None,
        }
    }

    /// Attach the initializer each process runs before providing a logger.
    pub fn with_logger_init(mut self, init: LoggerInit) -> Self {
        self.logger_init = Some(init);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn takes_logger(&self) -> bool {
        matches!(self.callback, Callback::WithLogger(_))
    }

    pub fn logger_init(&self) -> Option<LoggerInit> {
        self.logger_init
    }

    /// Same name, same callback and same logger initializer.
    pub fn same_callable(&self, other: &Job<T>) -> bool {
        let same_callback = match (&self.callback, &other.callback) {
            (Callback::Plain(a), Callback::Plain(b)) => std::ptr::fn_addr_eq(*a, *b),
            (Callback::WithLogger(a), Callback::WithLogger(b)) => std::ptr::fn_addr_eq(*a, *b),
            _ => false,
        };
        let same_init = match (self.logger_init, other.logger_init) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_as(&b),
            _ => false,
        };
        self.name == other.name && same_callback && same_init
    }

    /// Check the call contract before any work starts.
    pub fn validate(&self, provide_logger: bool, logger_init_args: &LogArgs) -> Result<()> {
        match (provide_logger, self.takes_logger()) {
            (true, false) => {
                return Err(PoolError::Precondition(format!(
                    "Logging was requested. The callback of job '{}' should take (item, logger), not (item)",
                    self.name
                )));
            }
            (false, true) => {
                return Err(PoolError::Precondition(format!(
                    "Logging was not requested. The callback of job '{}' should take (item), not (item, logger)",
                    self.name
                )));
            }
            _ => {}
        }

        if let Some(init) = self.logger_init {
            let has_args = !logger_init_args.is_empty();
            if has_args && !init.takes_args() {
                return Err(PoolError::Precondition(format!(
                    "Logger init arguments were supplied but the initializer of job '{}' does not accept them",
                    self.name
                )));
            }
            if !has_args && init.takes_args() {
                return Err(PoolError::Precondition(format!(
                    "The initializer of job '{}' expects arguments but none were supplied",
                    self.name
                )));
            }
        }

        Ok(())
    }

    /// Invoke the callback on one item.
    pub fn invoke(
        &self,
        item: &mut T,
        logger: Option<&WorkLogger>,
    ) -> std::result::Result<(), CallbackError> {
        match (&self.callback, logger) {
            (Callback::Plain(f), _) => f(item),
            (Callback::WithLogger(f), Some(logger)) => f(item, logger),
            (Callback::WithLogger(f), None) => f(item, &WorkLogger::for_process()),
        }
    }
}

/// Runs a job on one item of type `I`.
pub(crate) trait Runner<I>: Send + Sync + 'static {
    fn run(&self, item: &mut I, logger: Option<&WorkLogger>)
    -> std::result::Result<(), CallbackError>;
}

impl<T: WorkItem> Runner<T> for Job<T> {
    fn run(
        &self,
        item: &mut T,
        logger: Option<&WorkLogger>,
    ) -> std::result::Result<(), CallbackError> {
        self.invoke(item, logger)
    }
}

/// A registered job with its item type erased to JSON.
pub(crate) trait ErasedJob: Send + Sync {
    fn name(&self) -> &'static str;
    fn item_type(&self) -> &'static str;
    fn takes_logger(&self) -> bool;
    fn logger_init(&self) -> Option<LoggerInit>;
    fn as_any(&self) -> &dyn Any;
    fn run_value(
        &self,
        item: &mut Value,
        logger: Option<&WorkLogger>,
    ) -> std::result::Result<(), CallbackError>;
}

struct Registered<T>(Job<T>);

impl<T: WorkItem> ErasedJob for Registered<T> {
    fn name(&self) -> &'static str {
        self.0.name
    }

    fn item_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn takes_logger(&self) -> bool {
        self.0.takes_logger()
    }

    fn logger_init(&self) -> Option<LoggerInit> {
        self.0.logger_init
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn run_value(
        &self,
        item: &mut Value,
        logger: Option<&WorkLogger>,
    ) -> std::result::Result<(), CallbackError> {
        let mut typed: T = serde_json::from_value(item.take())
            .map_err(|e| CallbackError::new(format!("Cannot decode work item: {}", e)))?;
        self.0.invoke(&mut typed, logger)?;
        *item = serde_json::to_value(&typed)
            .map_err(|e| CallbackError::new(format!("Cannot encode work item: {}", e)))?;
        Ok(())
    }
}

impl Runner<Value> for Arc<dyn ErasedJob> {
    fn run(
        &self,
        item: &mut Value,
        logger: Option<&WorkLogger>,
    ) -> std::result::Result<(), CallbackError> {
        self.run_value(item, logger)
    }
}

static INSTALLED: OnceLock<JobRegistry> = OnceLock::new();

/// Jobs a worker process can run, keyed by name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<&'static str, Arc<dyn ErasedJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. A job with the same name is replaced.
    pub fn register<T: WorkItem>(&mut self, job: Job<T>) -> &mut Self {
        if self
            .jobs
            .insert(job.name, Arc::new(Registered(job.clone())))
            .is_some()
        {
            tracing::debug!(job = job.name, "Replaced registered job");
        }
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T: WorkItem>(mut self, job: Job<T>) -> Self {
        self.register(job);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered job names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.jobs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn ErasedJob>> {
        self.jobs.get(name).cloned()
    }

    /// Make this the registry of the current process.
    ///
    /// [`run_if_worker`](crate::run_if_worker) does this in the caller's
    /// process. The first installed registry stays; later calls return it.
    pub fn install(self) -> &'static JobRegistry {
        INSTALLED.get_or_init(|| self)
    }

    /// The registry installed in this process, if any.
    pub fn installed() -> Option<&'static JobRegistry> {
        INSTALLED.get()
    }

    /// Check that a worker process resolving `job` by name would run exactly
    /// this job: same item type, callback and logger initializer.
    pub fn check_job<T: WorkItem>(&self, job: &Job<T>) -> Result<()> {
        let Some(entry) = self.jobs.get(job.name) else {
            return Err(PoolError::Precondition(format!(
                "Job '{}' is not registered. Registered jobs: {}",
                job.name,
                self.names().join(", ")
            )));
        };
        let Some(Registered(registered)) = entry.as_any().downcast_ref::<Registered<T>>() else {
            return Err(PoolError::Precondition(format!(
                "Job '{}' is registered for {}, not {}",
                job.name,
                entry.item_type(),
                std::any::type_name::<T>()
            )));
        };
        if !registered.same_callable(job) {
            return Err(PoolError::Precondition(format!(
                "Job '{}' does not match the registered job of that name. Worker processes only run registered callbacks",
                job.name
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogConfig;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Counter {
        n: u32,
    }

    fn bump(c: &mut Counter) -> std::result::Result<(), CallbackError> {
        c.n += 1;
        Ok(())
    }

    fn bump_logged(c: &mut Counter, logger: &WorkLogger) -> std::result::Result<(), CallbackError> {
        c.n += 10;
        logger.debug(format!("n={}", c.n));
        Ok(())
    }

    fn refuse(c: &mut Counter) -> std::result::Result<(), CallbackError> {
        c.n = 99;
        Err(CallbackError::new("refused"))
    }

    fn plain_init(_: &mut LogConfig) {}

    fn args_init(_: &mut LogConfig, _: &LogArgs) {}

    #[test]
    fn test_validate_logger_arity() {
        let plain = Job::new("bump", bump);
        let logged = Job::with_logger("bump_logged", bump_logged);
        let args = LogArgs::new();

        assert!(plain.validate(false, &args).is_ok());
        assert!(logged.validate(true, &args).is_ok());

        let err = plain.validate(true, &args).unwrap_err();
        assert!(matches!(err, PoolError::Precondition(_)));
        assert!(err.to_string().contains("(item, logger)"));

        let err = logged.validate(false, &args).unwrap_err();
        assert!(matches!(err, PoolError::Precondition(_)));
    }

    #[test]
    fn test_validate_logger_init_arguments() {
        let mut args = LogArgs::new();
        args.insert("level".into(), "debug".into());
        let empty = LogArgs::new();

        let plain = Job::with_logger("a", bump_logged).with_logger_init(LoggerInit::Plain(plain_init));
        assert!(plain.validate(true, &empty).is_ok());
        assert!(plain.validate(true, &args).is_err());

        let with_args =
            Job::with_logger("b", bump_logged).with_logger_init(LoggerInit::WithArgs(args_init));
        assert!(with_args.validate(true, &args).is_ok());
        assert!(with_args.validate(true, &empty).is_err());
    }

    #[test]
    fn test_invoke_and_callback_error() {
        let job = Job::new("refuse", refuse);
        let mut c = Counter { n: 0 };
        let err = job.invoke(&mut c, None).unwrap_err();
        assert_eq!(err.message(), "refused");
        // State written before the failure stays on the item.
        assert_eq!(c.n, 99);

        let logged = Job::with_logger("bump_logged", bump_logged);
        logged.invoke(&mut c, None).unwrap();
        assert_eq!(c.n, 109);
    }

    #[test]
    fn test_registry_runs_erased_job() {
        let registry = JobRegistry::new()
            .with(Job::new("bump", bump))
            .with(Job::with_logger("bump_logged", bump_logged));

        assert_eq!(registry.names(), vec!["bump", "bump_logged"]);
        assert!(registry.contains("bump"));
        assert!(!registry.contains("missing"));

        let job = registry.get("bump").unwrap();
        assert_eq!(job.item_type(), std::any::type_name::<Counter>());
        assert!(!job.takes_logger());

        let mut value = serde_json::json!({ "n": 1 });
        job.run_value(&mut value, None).unwrap();
        assert_eq!(value, serde_json::json!({ "n": 2 }));
    }

    #[test]
    fn test_erased_job_rejects_wrong_shape() {
        let registry = JobRegistry::new().with(Job::new("bump", bump));
        let job = registry.get("bump").unwrap();

        let mut value = serde_json::json!("not a counter");
        let err = job.run_value(&mut value, None).unwrap_err();
        assert!(err.message().contains("decode"));
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Other {
        n: u32,
    }

    fn bump_other(o: &mut Other) -> std::result::Result<(), CallbackError> {
        o.n += 1;
        Ok(())
    }

    #[test]
    fn test_check_job_accepts_the_registered_callable() {
        let registry = JobRegistry::new()
            .with(Job::new("bump", bump))
            .with(Job::with_logger("bump_logged", bump_logged).with_logger_init(LoggerInit::Plain(plain_init)));

        assert!(registry.check_job(&Job::new("bump", bump)).is_ok());
        assert!(
            registry
                .check_job(
                    &Job::with_logger("bump_logged", bump_logged)
                        .with_logger_init(LoggerInit::Plain(plain_init))
                )
                .is_ok()
        );
    }

    #[test]
    fn test_check_job_rejects_a_different_callable() {
        let registry = JobRegistry::new()
            .with(Job::new("bump", bump))
            .with(Job::with_logger("bump_logged", bump_logged).with_logger_init(LoggerInit::Plain(plain_init)));

        let err = registry.check_job(&Job::new("bump", refuse)).unwrap_err();
        assert!(matches!(err, PoolError::Precondition(_)));
        assert!(err.to_string().contains("does not match"));

        // Same callback, different initializer.
        let err = registry
            .check_job(
                &Job::with_logger("bump_logged", bump_logged)
                    .with_logger_init(LoggerInit::WithArgs(args_init)),
            )
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));

        let err = registry
            .check_job(&Job::with_logger("bump_logged", bump_logged))
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_check_job_rejects_unknown_name_and_item_type() {
        let registry = JobRegistry::new().with(Job::new("bump", bump));

        let err = registry.check_job(&Job::new("missing", bump)).unwrap_err();
        assert!(err.to_string().contains("'missing' is not registered"));

        let err = registry.check_job(&Job::new("bump", bump_other)).unwrap_err();
        assert!(matches!(err, PoolError::Precondition(_)));
        assert!(err.to_string().contains(std::any::type_name::<Other>()));
    }

    #[test]
    fn test_logger_init_identity() {
        assert!(LoggerInit::Plain(plain_init).same_as(&LoggerInit::Plain(plain_init)));
        assert!(!LoggerInit::Plain(plain_init).same_as(&LoggerInit::WithArgs(args_init)));
    }
}
