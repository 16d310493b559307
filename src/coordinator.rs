use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::browser::{Launcher, SessionGuard, WaitCondition};
use crate::config::Settings;
use crate::db;
use crate::error::RunError;
use crate::extract::intercept::ResponseInterceptor;
use crate::extract::markup::MarkupExtractor;
use crate::extract::script_scope::ScriptScopeExtractor;
use crate::extract::table::TableExtractor;
use crate::extract::{self, shape, ExtractionResult};
use crate::normalize::normalize;
use crate::record::{self, VesselRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NavigatingLogin,
    Authenticating,
    NavigatingTarget,
    AwaitingSettle,
    Extracting,
    Persisting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::NavigatingLogin => "navigating-login",
            Phase::Authenticating => "authenticating",
            Phase::NavigatingTarget => "navigating-target",
            Phase::AwaitingSettle => "awaiting-settle",
            Phase::Extracting => "extracting",
            Phase::Persisting => "persisting",
        };
        f.write_str(name)
    }
}

/// Wall-clock budget for a whole run. Every wait is clamped to what is left.
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn check(&self) -> Result<(), RunError> {
        if self.remaining().is_zero() {
            Err(RunError::Timeout(self.budget))
        } else {
            Ok(())
        }
    }

    /// `wait` shortened to the remaining budget; an error once nothing is left.
    pub fn clamp(&self, wait: Duration) -> Result<Duration, RunError> {
        self.check()?;
        Ok(wait.min(self.remaining()))
    }
}

/// At most one run in flight. A second acquirer gets `None` instead of waiting.
#[derive(Default)]
pub struct RunGuard {
    running: AtomicBool,
}

pub struct RunPermit<'a>(&'a RunGuard);

impl RunGuard {
    pub fn try_acquire(&self) -> Option<RunPermit<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit(self))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for RunPermit<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub seen: usize,
    pub saved: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub source: Option<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Completed(RunOutcome),
    /// Another run held the guard; nothing was done.
    Skipped,
}

/// Drives one run end to end: browser session, login, target page, the
/// extraction chain, normalization and the upsert batch.
pub struct Coordinator {
    settings: Settings,
    launcher: Box<dyn Launcher>,
    conn: Mutex<Connection>,
    guard: RunGuard,
    latest: Mutex<Option<Arc<Vec<VesselRecord>>>>,
    table: TableExtractor,
    globals: ScriptScopeExtractor,
}

impl Coordinator {
    pub fn new(settings: Settings, launcher: Box<dyn Launcher>, conn: Connection) -> Self {
        let table = TableExtractor::new(settings.table_selectors.clone());
        let globals = ScriptScopeExtractor::new(settings.known_globals.clone());
        Self {
            settings,
            launcher,
            conn: Mutex::new(conn),
            guard: RunGuard::default(),
            latest: Mutex::new(None),
            table,
            globals,
        }
    }

    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    /// Most recent normalized dataset, if any run has extracted one.
    pub fn latest(&self) -> Option<Arc<Vec<VesselRecord>>> {
        lock(&self.latest).clone()
    }

    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        lock(&self.conn)
    }

    pub fn run(&self) -> Result<RunStatus, RunError> {
        let Some(_permit) = self.guard.try_acquire() else {
            info!("Previous run still in progress, skipping this tick");
            return Ok(RunStatus::Skipped);
        };

        let started = Instant::now();
        let deadline = Deadline::new(self.settings.run_timeout());
        match self.run_inner(&deadline, started) {
            Ok(outcome) => {
                info!(
                    seen = outcome.seen,
                    saved = outcome.saved,
                    failed = outcome.failed,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "Run finished"
                );
                Ok(RunStatus::Completed(outcome))
            }
            Err(e) => {
                error!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Run failed: {}", e
                );
                Err(e)
            }
        }
    }

    fn run_inner(&self, deadline: &Deadline, started: Instant) -> Result<RunOutcome, RunError> {
        let (records, source) = match self.extract(deadline)? {
            ExtractionResult::Found(found) => {
                let records: Vec<VesselRecord> = shape::records(&found.payload)
                    .into_iter()
                    .filter_map(record::from_raw)
                    .map(normalize)
                    .collect();
                (records, Some(found.source))
            }
            ExtractionResult::NotFound => {
                warn!("No vessel data found by any strategy");
                (Vec::new(), None)
            }
        };

        let seen = records.len();
        let records = Arc::new(records);
        // a miss keeps the previous dataset
        if source.is_some() {
            *lock(&self.latest) = Some(Arc::clone(&records));
        }

        debug!(phase = %Phase::Persisting);
        let stats = if records.is_empty() {
            db::UpsertStats::default()
        } else {
            let conn = lock(&self.conn);
            db::upsert_batch(&conn, &records)?
        };

        Ok(RunOutcome {
            seen,
            saved: stats.saved(),
            unchanged: stats.unchanged,
            failed: stats.failed,
            source,
            elapsed: started.elapsed(),
        })
    }

    /// Owns the browser session; it is closed on every path out of here.
    fn extract(&self, deadline: &Deadline) -> Result<ExtractionResult, RunError> {
        let session = self
            .launcher
            .launch()
            .map_err(|e| RunError::Launch(format!("{:#}", e)))?;
        let mut guard = SessionGuard::new(session);
        let session = guard.session();

        let interceptor = ResponseInterceptor::new(self.settings.intercept_paths.clone());
        if let Err(e) = session.intercept(interceptor.handler()) {
            warn!("Response interception unavailable: {:#}", e);
        }

        debug!(phase = %Phase::NavigatingLogin);
        auth::login(session, &self.settings, deadline)?;

        debug!(phase = %Phase::NavigatingTarget);
        let nav_timeout = deadline.clamp(self.settings.navigation_timeout())?;
        session
            .navigate(&self.settings.target_url, WaitCondition::NetworkIdle, nav_timeout)
            .map_err(|e| RunError::Navigation {
                url: self.settings.target_url.clone(),
                reason: format!("{:#}", e),
            })?;

        debug!(phase = %Phase::AwaitingSettle);
        let settle = deadline.clamp(self.settings.settle_delay())?;
        std::thread::sleep(settle);
        deadline.check()?;

        debug!(phase = %Phase::Extracting);
        Ok(extract::extract(
            session,
            &interceptor,
            &self.table,
            &self.globals,
            &MarkupExtractor,
        ))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    use anyhow::{anyhow, Result};
    use serde_json::{json, Value};

    use super::*;
    use crate::browser::{BrowserSession, NetworkResponse, ResponseHandler};
    use crate::record::{Scalar, IDENTITY_KEY};

    pub(crate) fn settings() -> Settings {
        Settings {
            db_path: ":memory:".into(),
            login_url: "https://site.test/login".into(),
            target_url: "https://site.test/en/data".into(),
            username: "user@example.com".into(),
            password: "secret".into(),
            username_selector: "#email".into(),
            password_selector: "#password".into(),
            submit_selector: "#submit".into(),
            consent_selector: ".consent".into(),
            table_selectors: vec!["table".into()],
            known_globals: vec!["reportData".into()],
            intercept_paths: vec!["/reports".into()],
            interval_secs: 60,
            run_timeout_secs: 30,
            navigation_timeout_secs: 5,
            step_timeout_secs: 1,
            settle_delay_ms: 0,
            headless: true,
            sandbox: false,
        }
    }

    /// Scripted page behaviour shared by every session a launcher creates.
    #[derive(Clone, Default)]
    pub(crate) struct Script {
        html: String,
        globals: Value,
        /// (url, body) fired through the interceptor on target navigation.
        responses: Vec<(String, String)>,
        login_form: bool,
        fail_target: bool,
    }

    pub(crate) type Gate = (Arc<Barrier>, Arc<Barrier>);

    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        pub script: Script,
        /// Served instead of `script` from the second launch on.
        pub later: Option<Script>,
        pub launches: Arc<AtomicUsize>,
        pub open: Arc<AtomicUsize>,
        /// Parks the first session's target navigation: (entered, release).
        pub gate: Mutex<Option<Gate>>,
    }

    impl Launcher for FakeLauncher {
        fn launch(&self) -> Result<Box<dyn BrowserSession>> {
            let n = self.launches.fetch_add(1, Ordering::SeqCst);
            self.open.fetch_add(1, Ordering::SeqCst);
            let script = match &self.later {
                Some(later) if n > 0 => later.clone(),
                _ => self.script.clone(),
            };
            Ok(Box::new(FakeSession {
                script,
                open: Arc::clone(&self.open),
                handler: None,
                gate: self.gate.lock().unwrap().take(),
            }))
        }
    }

    struct FakeSession {
        script: Script,
        open: Arc<AtomicUsize>,
        handler: Option<ResponseHandler>,
        gate: Option<Gate>,
    }

    impl BrowserSession for FakeSession {
        fn navigate(&mut self, url: &str, _: WaitCondition, _: Duration) -> Result<()> {
            if !url.ends_with("/data") {
                return Ok(());
            }
            if let Some((entered, release)) = self.gate.take() {
                entered.wait();
                release.wait();
            }
            if self.script.fail_target {
                return Err(anyhow!("net::ERR_TIMED_OUT"));
            }
            if let Some(handler) = &self.handler {
                for (resp_url, body) in &self.script.responses {
                    let body = body.clone();
                    let fetch = move || -> Result<String> { Ok(body.clone()) };
                    handler(&NetworkResponse::new(resp_url, "application/json", 200, &fetch));
                }
            }
            Ok(())
        }
        fn intercept(&mut self, handler: ResponseHandler) -> Result<()> {
            self.handler = Some(handler);
            Ok(())
        }
        fn wait_for_element(&mut self, selector: &str, _: Duration) -> Result<bool> {
            Ok(selector == "#email" && self.script.login_form)
        }
        fn click(&mut self, _: &str) -> Result<()> {
            Ok(())
        }
        fn type_into(&mut self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn wait_for_navigation(&mut self, _: Duration) -> Result<()> {
            Ok(())
        }
        fn content(&self) -> Result<String> {
            Ok(self.script.html.clone())
        }
        fn evaluate(&self, _: &str) -> Result<Value> {
            Ok(Value::String(self.script.globals.to_string()))
        }
        fn close(self: Box<Self>) -> Result<()> {
            self.open.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn with_launcher(settings: Settings, launcher: FakeLauncher) -> Coordinator {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        Coordinator::new(settings, Box::new(launcher), conn)
    }

    fn coordinator(script: Script) -> (Coordinator, Arc<AtomicUsize>) {
        let launcher = FakeLauncher {
            script,
            ..Default::default()
        };
        let open = Arc::clone(&launcher.open);
        (with_launcher(settings(), launcher), open)
    }

    pub(crate) fn report_data_script() -> Script {
        Script {
            html: "<html><body><div id=app></div></body></html>".into(),
            globals: json!([{"name": "reportData", "value": {"data": [{"imo": "123", "mmsi": "456"}]}}]),
            login_form: true,
            ..Default::default()
        }
    }

    fn completed(status: RunStatus) -> RunOutcome {
        match status {
            RunStatus::Completed(o) => o,
            RunStatus::Skipped => panic!("run was skipped"),
        }
    }

    #[test]
    fn script_scope_end_to_end() {
        let (c, open) = coordinator(report_data_script());
        let outcome = completed(c.run().unwrap());
        assert_eq!(outcome.source.as_deref(), Some("global window.reportData"));
        assert_eq!((outcome.seen, outcome.saved, outcome.failed), (1, 1, 0));
        assert_eq!(db::count(&c.connection()).unwrap(), 1);
        let id: String = c
            .connection()
            .query_row("SELECT SHIP_ID FROM vessels", [], |r| r.get(0))
            .unwrap();
        assert_eq!(id, "123");
        assert_eq!(open.load(Ordering::SeqCst), 0);

        let latest = c.latest().unwrap();
        assert_eq!(latest[0][IDENTITY_KEY], Scalar::Text("123".into()));
    }

    #[test]
    fn intercepted_response_preferred() {
        let mut script = report_data_script();
        script.responses = vec![
            ("https://site.test/en/reports?p=1".into(), r#"{"data":[{"SHIP_ID":"9","SPEED":"7,5"}]}"#.into()),
            ("https://site.test/en/reports/meta".into(), r#"{"ok":true}"#.into()),
        ];
        let (c, _) = coordinator(script);
        let outcome = completed(c.run().unwrap());
        assert!(outcome.source.unwrap().contains("/en/reports?p=1"));
        let speed: f64 = c
            .connection()
            .query_row("SELECT SPEED FROM vessels WHERE SHIP_ID = '9'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(speed, 7.5);
    }

    #[test]
    fn dom_table_used_when_no_response() {
        let script = Script {
            html: std::fs::read_to_string("tests/fixtures/report_table.html").unwrap(),
            globals: json!([]),
            login_form: true,
            ..Default::default()
        };
        let (c, _) = coordinator(script);
        let outcome = completed(c.run().unwrap());
        assert_eq!(outcome.seen, 3);
        assert_eq!(outcome.saved, 3);
        let launch: String = c
            .connection()
            .query_row("SELECT LAUNCH_DATE FROM vessels WHERE SHIP_ID = '712001'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(launch, "1999-03-03");
    }

    #[test]
    fn nothing_found_is_not_an_error() {
        let script = Script {
            html: "<html></html>".into(),
            globals: json!([]),
            login_form: true,
            ..Default::default()
        };
        let (c, _) = coordinator(script);
        let outcome = completed(c.run().unwrap());
        assert_eq!(outcome.seen, 0);
        assert!(outcome.source.is_none());
    }

    #[test]
    fn missing_login_form_fails_run_and_releases_session() {
        let mut script = report_data_script();
        script.login_form = false;
        let (c, open) = coordinator(script);
        assert!(matches!(c.run(), Err(RunError::Authentication(_))));
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert!(!c.is_running());
    }

    #[test]
    fn target_navigation_failure_is_fatal() {
        let mut script = report_data_script();
        script.fail_target = true;
        let (c, open) = coordinator(script);
        assert!(matches!(c.run(), Err(RunError::Navigation { .. })));
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn overlapping_run_is_skipped() {
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let launcher = FakeLauncher {
            script: report_data_script(),
            gate: Mutex::new(Some((Arc::clone(&entered), Arc::clone(&release)))),
            ..Default::default()
        };
        let open = Arc::clone(&launcher.open);
        let c = with_launcher(settings(), launcher);

        std::thread::scope(|s| {
            let first = s.spawn(|| c.run());
            entered.wait();
            assert!(c.is_running());
            assert_eq!(open.load(Ordering::SeqCst), 1);
            assert_eq!(c.run().unwrap(), RunStatus::Skipped);
            assert_eq!(open.load(Ordering::SeqCst), 1);
            release.wait();
            let outcome = completed(first.join().unwrap().unwrap());
            assert_eq!(outcome.saved, 1);
        });
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert!(completed(c.run().unwrap()).seen == 1);
    }

    #[test]
    fn exhausted_run_budget_times_out_and_releases_session() {
        let launcher = FakeLauncher {
            script: report_data_script(),
            ..Default::default()
        };
        let open = Arc::clone(&launcher.open);
        let launches = Arc::clone(&launcher.launches);
        let c = with_launcher(
            Settings {
                run_timeout_secs: 0,
                ..settings()
            },
            launcher,
        );
        assert!(matches!(c.run(), Err(RunError::Timeout(_))));
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert!(!c.is_running());
        assert_eq!(db::count(&c.connection()).unwrap(), 0);
    }

    #[test]
    fn empty_run_keeps_previous_dataset() {
        let launcher = FakeLauncher {
            script: report_data_script(),
            later: Some(Script {
                html: "<html></html>".into(),
                globals: json!([]),
                login_form: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let c = with_launcher(settings(), launcher);
        assert_eq!(completed(c.run().unwrap()).seen, 1);
        let outcome = completed(c.run().unwrap());
        assert_eq!(outcome.seen, 0);
        assert!(outcome.source.is_none());

        let latest = c.latest().unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0][IDENTITY_KEY], Scalar::Text("123".into()));
    }

    #[test]
    fn nothing_extracted_yet() {
        let (c, _) = coordinator(Script {
            html: "<html></html>".into(),
            globals: json!([]),
            login_form: true,
            ..Default::default()
        });
        completed(c.run().unwrap());
        assert!(c.latest().is_none());
    }

    #[test]
    fn phase_names() {
        let names: Vec<String> = [
            Phase::NavigatingLogin,
            Phase::Authenticating,
            Phase::NavigatingTarget,
            Phase::AwaitingSettle,
            Phase::Extracting,
            Phase::Persisting,
        ]
        .iter()
        .map(Phase::to_string)
        .collect();
        assert_eq!(
            names,
            [
                "navigating-login",
                "authenticating",
                "navigating-target",
                "awaiting-settle",
                "extracting",
                "persisting"
            ]
        );
    }

    #[test]
    fn exhausted_deadline() {
        let d = Deadline::new(Duration::ZERO);
        assert!(matches!(d.check(), Err(RunError::Timeout(_))));
        let d = Deadline::new(Duration::from_secs(60));
        assert_eq!(d.clamp(Duration::from_secs(5)).unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn guard_releases_on_drop() {
        let g = RunGuard::default();
        let p = g.try_acquire();
        assert!(p.is_some());
        assert!(g.try_acquire().is_none());
        drop(p);
        assert!(g.try_acquire().is_some());
    }
}
