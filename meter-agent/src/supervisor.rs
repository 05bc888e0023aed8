//! Supervisor loop
//!
//! One iteration, strictly sequential:
//! 1. read the position
//! 2. publish on movement (first fix only becomes the baseline)
//! 3. publish when the max interval elapsed without a publish
//! 4. check for and apply an update
//!
//! Each iteration runs inside a failure boundary: errors and panics are logged and
//! the loop keeps its cadence.

use crate::config::AgentConfig;
use crate::error::Result;
use crate::gnss::{GpsFix, PositionReader};
use crate::meter::{Meter, RegisterBus};
use crate::modem::AtChannel;
use crate::movement::{distance, should_publish_for_movement};
use crate::publisher::{DeviceIdentity, Publisher, TelemetryPayload};
use crate::system::{apply_restart_policy, AfterInstall};
use crate::updater::AgentUpdater;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Owned by the supervisor only, reset on restart
#[derive(Debug, Clone)]
pub struct AgentState {
    pub last_fix: Option<GpsFix>,
    pub last_publish: Instant,
    pub threshold_m: f64,
    pub max_interval: Duration,
    pub last_update_check: Option<Instant>,
}

impl AgentState {
    pub fn new(threshold_m: f64, max_interval: Duration) -> Self {
        Self {
            last_fix: None,
            last_publish: Instant::now(),
            threshold_m,
            max_interval,
            last_update_check: None,
        }
    }

    fn interval_elapsed(&self) -> bool {
        self.last_publish.elapsed() >= self.max_interval
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishTrigger {
    Movement,
    Interval,
}

#[derive(Debug, Clone, Default)]
pub struct IterationReport {
    pub fix: Option<GpsFix>,
    pub published: Option<PublishTrigger>,
    pub after_install: Option<AfterInstall>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Shutdown signal received
    Stopped,
    /// A new program is installed and the process should exit
    RestartRequested,
    Rebooting,
}

pub struct Supervisor<B, T> {
    meter: Meter<B>,
    at: AtChannel<T>,
    position: PositionReader,
    publisher: Publisher,
    updater: AgentUpdater,
    identity: DeviceIdentity,
    state: AgentState,
    poll_interval: Duration,
    reboot_command: Vec<String>,
}

impl<B, T> Supervisor<B, T>
where
    B: RegisterBus,
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(config: &AgentConfig, bus: B, at: AtChannel<T>) -> Result<Self> {
        Ok(Self {
            meter: Meter::new(bus, &config.meter),
            at,
            position: PositionReader::from_config(&config.modem),
            publisher: Publisher::new(config.broker.clone(), &config.publish),
            updater: AgentUpdater::new(config.update.clone())?,
            identity: DeviceIdentity::from(&config.device),
            state: AgentState::new(
                config.publish.movement_threshold_m,
                Duration::from_secs(config.publish.max_interval_secs),
            ),
            poll_interval: Duration::from_secs(config.supervisor.poll_interval_secs.max(1)),
            reboot_command: config.update.reboot_command.clone(),
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Run until Ctrl-C or a restart request
    pub async fn run(&mut self) -> RunOutcome {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    pub async fn run_until<F>(&mut self, shutdown: F) -> RunOutcome
    where
        F: Future<Output = ()>,
    {
        info!("Supervisor running, poll interval {:?}", self.poll_interval);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping supervisor");
                    return RunOutcome::Stopped;
                }
            }

            match AssertUnwindSafe(self.run_iteration()).catch_unwind().await {
                Ok(Ok(report)) => {
                    debug!("Iteration done, fix {:?}, published {:?}", report.fix, report.published);
                    match report.after_install {
                        Some(AfterInstall::Exit) => return RunOutcome::RestartRequested,
                        Some(AfterInstall::Rebooting) => return RunOutcome::Rebooting,
                        Some(AfterInstall::Continue) | None => {}
                    }
                }
                Ok(Err(e)) => error!("Iteration failed: {}", e),
                Err(panic) => error!("Iteration panicked: {}", panic_message(panic.as_ref())),
            }
        }
    }

    pub async fn run_iteration(&mut self) -> Result<IterationReport> {
        let mut report = IterationReport::default();

        let fix = self.position.get_fix(&mut self.at).await;
        report.fix = fix;

        if let Some(fix) = fix {
            match self.state.last_fix {
                None => {
                    info!("Baseline position {:.6}, {:.6}", fix.latitude, fix.longitude);
                    self.state.last_fix = Some(fix);
                }
                Some(last) => {
                    if should_publish_for_movement(Some(&last), &fix, self.state.threshold_m) {
                        info!("Moved {:.1} m, publishing", distance(&last, &fix));
                        self.publish(Some(fix)).await?;
                        self.state.last_fix = Some(fix);
                        self.state.last_publish = Instant::now();
                        report.published = Some(PublishTrigger::Movement);
                    } else {
                        debug!("Moved {:.1} m, below threshold", distance(&last, &fix));
                    }
                }
            }
        }

        if report.published.is_none() && self.state.interval_elapsed() {
            info!("No publish for {:?}, publishing", self.state.max_interval);
            let known = fix.or(self.state.last_fix);
            self.publish(known).await?;
            self.state.last_publish = Instant::now();
            self.state.last_fix = known;
            report.published = Some(PublishTrigger::Interval);
        }

        report.after_install = self.check_update().await;
        Ok(report)
    }

    async fn publish(&mut self, fix: Option<GpsFix>) -> Result<()> {
        let payload = match self.meter.read().await {
            Ok(reading) => TelemetryPayload::reading(self.identity.clone(), reading, fix),
            Err(e) => {
                warn!("Meter read failed, publishing placeholder: {}", e);
                TelemetryPayload::unavailable()
            }
        };
        self.publisher.publish(&mut self.at, &payload).await?;
        Ok(())
    }

    async fn check_update(&mut self) -> Option<AfterInstall> {
        if !self.updater.is_enabled() {
            return None;
        }
        let due = match self.state.last_update_check {
            Some(at) => at.elapsed() >= self.updater.check_interval(),
            None => true,
        };
        if !due {
            return None;
        }
        self.state.last_update_check = Some(Instant::now());

        let offer = self.updater.check_for_update().await?;
        match self.updater.apply_update(&offer).await {
            Ok(installed) => {
                info!("Update {} installed ({} bytes)", installed.version, installed.bytes);
                Some(apply_restart_policy(self.updater.restart_policy(), &self.reboot_command).await)
            }
            Err(e) => {
                error!("Update to {} failed, keeping current program: {}", offer.version, e);
                None
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartPolicy;
    use crate::meter::bus::tests::ScriptedBus;
    use crate::meter::registers::REGISTER_BLOCK_LEN;
    use meter_devkit::fixtures::manifest;
    use meter_devkit::{NmeaBuilder, RegisterImage, TestHarness};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    fn config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.device.serial_number = "EM-42".into();
        config.modem.fix_attempts = 1;
        config.modem.command_timeout_ms = 500;
        config.publish.movement_threshold_m = 50.0;
        config.publish.max_interval_secs = 30;
        config
    }

    fn readings(count: usize) -> Vec<Result<Vec<u16>>> {
        (0..count)
            .map(|_| {
                Ok(RegisterImage::new(REGISTER_BLOCK_LEN as usize)
                    .float(0, 231.0)
                    .words())
            })
            .collect()
    }

    fn supervisor(
        harness: &TestHarness,
        config: &AgentConfig,
        bus: ScriptedBus,
    ) -> Supervisor<ScriptedBus, DuplexStream> {
        let at = AtChannel::new(harness.modem.connect(), config.modem.command_timeout());
        Supervisor::new(config, bus, at).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fix_becomes_baseline_without_publish() {
        let harness = TestHarness::new().await.unwrap();
        harness.gnss_track(&[(48.0, 11.0)]).broker_accepting();
        let mut supervisor = supervisor(&harness, &config(), ScriptedBus::new(readings(1)));

        let report = supervisor.run_iteration().await.unwrap();

        assert!(report.fix.is_some());
        assert_eq!(report.published, None);
        assert_eq!(supervisor.state().last_fix, report.fix);
        harness.assert_publish_count(0).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_movement_over_threshold_publishes_and_moves_baseline() {
        let harness = TestHarness::new().await.unwrap();
        harness
            .gnss_track(&[(48.0, 11.0), (48.01, 11.0), (48.0101, 11.0)])
            .broker_accepting();
        let mut supervisor = supervisor(&harness, &config(), ScriptedBus::new(readings(1)));

        supervisor.run_iteration().await.unwrap();
        let moved = supervisor.run_iteration().await.unwrap();
        // ~11 m from the new baseline
        let small = supervisor.run_iteration().await.unwrap();

        assert_eq!(moved.published, Some(PublishTrigger::Movement));
        assert_eq!(small.published, None);
        assert_eq!(supervisor.state().last_fix, moved.fix);
        harness.assert_publish_count(1).unwrap();

        let payload = &harness.published_payloads().unwrap()[0];
        assert_eq!(payload["serial_number"], "EM-42");
        assert_eq!(payload["voltage_l1"], 231.0);
        assert!((payload["latitude"].as_f64().unwrap() - 48.01).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_fallback_publishes_without_fix() {
        let harness = TestHarness::new().await.unwrap();
        harness.gnss_without_fix().broker_accepting();
        let mut supervisor = supervisor(&harness, &config(), ScriptedBus::new(readings(1)));

        let early = supervisor.run_iteration().await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        let late = supervisor.run_iteration().await.unwrap();

        assert_eq!(early.published, None);
        assert_eq!(late.fix, None);
        assert_eq!(late.published, Some(PublishTrigger::Interval));
        assert_eq!(supervisor.state().last_fix, None);

        let payload = &harness.published_payloads().unwrap()[0];
        assert!(payload["latitude"].is_null());
        assert!(payload["longitude"].is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_fallback_adopts_current_fix() {
        let harness = TestHarness::new().await.unwrap();
        harness.gnss_track(&[(48.0, 11.0)]).broker_accepting();
        let mut supervisor = supervisor(&harness, &config(), ScriptedBus::new(readings(1)));

        supervisor.run_iteration().await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let report = supervisor.run_iteration().await.unwrap();

        assert_eq!(report.published, Some(PublishTrigger::Interval));
        assert_eq!(supervisor.state().last_fix, report.fix);
        harness.assert_publish_count(1).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_fallback_uses_last_known_fix() {
        let harness = TestHarness::new().await.unwrap();
        harness.gnss_track(&[(48.0, 11.0)]).broker_accepting();
        harness.modem.respond(
            "AT+QGPSGNMEA=\"GGA\"",
            &NmeaBuilder::gnmea_response(&NmeaBuilder::gga_no_fix()),
        );
        let mut supervisor = supervisor(&harness, &config(), ScriptedBus::new(readings(1)));

        let first = supervisor.run_iteration().await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let report = supervisor.run_iteration().await.unwrap();

        assert_eq!(report.fix, None);
        assert_eq!(report.published, Some(PublishTrigger::Interval));
        assert_eq!(supervisor.state().last_fix, first.fix);
        let payload = &harness.published_payloads().unwrap()[0];
        assert!((payload["latitude"].as_f64().unwrap() - 48.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_meter_read_publishes_placeholder() {
        let harness = TestHarness::new().await.unwrap();
        harness.gnss_track(&[(48.0, 11.0), (48.1, 11.0)]).broker_accepting();
        let mut supervisor = supervisor(&harness, &config(), ScriptedBus::failing());

        supervisor.run_iteration().await.unwrap();
        let report = supervisor.run_iteration().await.unwrap();

        assert_eq!(report.published, Some(PublishTrigger::Movement));
        let payloads = harness.published_payloads().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], serde_json::json!({"Energy meter values": "None"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_keeps_cadence_until_shutdown() {
        let harness = TestHarness::new().await.unwrap();
        harness.gnss_track(&[(48.0, 11.0)]).broker_accepting();
        let mut cfg = config();
        cfg.supervisor.poll_interval_secs = 5;
        let mut supervisor = supervisor(&harness, &cfg, ScriptedBus::new(readings(1)));

        let outcome = supervisor
            .run_until(tokio::time::sleep(Duration::from_secs(12)))
            .await;

        assert_eq!(outcome, RunOutcome::Stopped);
        // ticks at 0 s, 5 s and 10 s
        assert_eq!(harness.modem.received_matching("AT+QGPSGNMEA").len(), 3);
    }

    #[tokio::test]
    async fn test_installed_update_requests_restart() {
        let harness = TestHarness::new().await.unwrap();
        harness.gnss_track(&[(48.0, 11.0)]).broker_accepting();
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("meter-agent");
        std::fs::write(&program, b"old").unwrap();

        harness.http.route(
            "/version.json",
            200,
            manifest("99.0.0", &harness.http.url("/fw.bin"), None).to_string(),
        );
        harness.http.route("/fw.bin", 200, b"new program".to_vec());

        let mut cfg = config();
        cfg.update.manifest_url = harness.http.url("/version.json");
        cfg.update.program_path = program.clone();
        cfg.update.restart = RestartPolicy::Exit;
        let mut supervisor = supervisor(&harness, &cfg, ScriptedBus::new(readings(1)));

        let outcome = supervisor.run_until(std::future::pending::<()>()).await;

        assert_eq!(outcome, RunOutcome::RestartRequested);
        assert_eq!(std::fs::read(&program).unwrap(), b"new program");
        assert_eq!(harness.http.hits("/fw.bin"), 1);
    }

    #[tokio::test]
    async fn test_installed_update_is_not_offered_again() {
        let harness = TestHarness::new().await.unwrap();
        harness.gnss_track(&[(48.0, 11.0)]).broker_accepting();
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("meter-agent");
        std::fs::write(&program, b"old").unwrap();

        harness.http.route(
            "/version.json",
            200,
            manifest("99.0.0", &harness.http.url("/fw.bin"), None).to_string(),
        );
        harness.http.route("/fw.bin", 200, b"new program".to_vec());

        let mut cfg = config();
        cfg.update.manifest_url = harness.http.url("/version.json");
        cfg.update.program_path = program.clone();
        cfg.update.restart = RestartPolicy::None;
        let mut supervisor = supervisor(&harness, &cfg, ScriptedBus::new(readings(1)));

        let first = supervisor.run_iteration().await.unwrap();
        let second = supervisor.run_iteration().await.unwrap();
        let third = supervisor.run_iteration().await.unwrap();

        assert_eq!(first.after_install, Some(AfterInstall::Continue));
        assert_eq!(second.after_install, None);
        assert_eq!(third.after_install, None);
        assert_eq!(harness.http.hits("/version.json"), 3);
        assert_eq!(harness.http.hits("/fw.bin"), 1);
    }

    #[tokio::test]
    async fn test_check_interval_limits_manifest_fetches() {
        let harness = TestHarness::new().await.unwrap();
        harness.gnss_track(&[(48.0, 11.0)]).broker_accepting();
        harness.http.route(
            "/version.json",
            200,
            manifest("0.0.1", &harness.http.url("/fw.bin"), None).to_string(),
        );

        let mut cfg = config();
        cfg.update.manifest_url = harness.http.url("/version.json");
        cfg.update.check_interval_secs = 3600;
        let mut supervisor = supervisor(&harness, &cfg, ScriptedBus::new(readings(1)));

        supervisor.run_iteration().await.unwrap();
        let report = supervisor.run_iteration().await.unwrap();

        assert_eq!(report.after_install, None);
        assert_eq!(harness.http.hits("/version.json"), 1);
    }

    /// Counts reads, then panics or fails
    struct FaultyBus {
        reads: Arc<AtomicUsize>,
        panics: bool,
    }

    impl RegisterBus for FaultyBus {
        async fn read_input_registers(&mut self, _: u8, _: u16, _: u16) -> Result<Vec<u16>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("bus driver fault");
            }
            Err(crate::error::AgentError::Transport("no response".into()))
        }
    }

    fn publish_every_tick() -> AgentConfig {
        let mut cfg = config();
        cfg.meter.retry_attempts = 1;
        cfg.publish.max_interval_secs = 0;
        cfg.supervisor.poll_interval_secs = 5;
        cfg
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_iteration_does_not_stop_the_loop() {
        let harness = TestHarness::new().await.unwrap();
        harness.gnss_track(&[(48.0, 11.0)]).broker_accepting();
        let reads = Arc::new(AtomicUsize::new(0));
        let bus = FaultyBus {
            reads: reads.clone(),
            panics: true,
        };
        let cfg = publish_every_tick();
        let at = AtChannel::new(harness.modem.connect(), cfg.modem.command_timeout());
        let mut supervisor = Supervisor::new(&cfg, bus, at).unwrap();

        let outcome = supervisor
            .run_until(tokio::time::sleep(Duration::from_secs(12)))
            .await;

        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert_eq!(harness.modem.received_matching("AT+QGPSGNMEA").len(), 3);
        harness.assert_publish_count(0).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_iteration_does_not_stop_the_loop() {
        let reads = Arc::new(AtomicUsize::new(0));
        let bus = FaultyBus {
            reads: reads.clone(),
            panics: false,
        };
        let cfg = publish_every_tick();
        let (client, modem_side) = tokio::io::duplex(64);
        drop(modem_side);
        let at = AtChannel::new(client, cfg.modem.command_timeout());
        let mut supervisor = Supervisor::new(&cfg, bus, at).unwrap();

        assert!(supervisor.run_iteration().await.is_err());

        let outcome = supervisor
            .run_until(tokio::time::sleep(Duration::from_secs(12)))
            .await;

        assert_eq!(outcome, RunOutcome::Stopped);
        // one read per tick at 0 s, 5 s and 10 s, after the direct call above
        assert_eq!(reads.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}
