//! Control-side entry point tying the interceptor, selectors and throttle set together.

use crate::backends::divert::DivertBackend;
use crate::backends::process::ProcessUtils;
use crate::interceptor::{Interceptor, StatsSnapshot};
use crate::process::{TargetMode, format_rate};
use crate::selector::{FixedSelector, FocusSelector, TargetSelector, process_group};
use crate::status::{Severity, StatusSink};
use crate::throttle_set::ThrottleSet;
use anyhow::{Result, anyhow};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Result of a successful toggle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Throttled { root: i32, name: String, pids: Vec<i32> },
    Unthrottled { root: i32, name: String, pids: Vec<i32> },
}

/// Initial values for a throttler
#[derive(Debug, Clone)]
pub struct ThrottlerSettings {
    pub rate_bytes_per_sec: u64,
    pub target_mode: TargetMode,
    pub fixed_target: Option<i32>,
    pub connection_cache: Duration,
}

pub struct Throttler {
    interceptor: Interceptor,
    process_utils: Arc<dyn ProcessUtils>,
    throttle_set: ThrottleSet,
    rate: Arc<AtomicU64>,
    fixed: FixedSelector,
    focus: FocusSelector,
    target_mode: TargetMode,
    status: Arc<dyn StatusSink>,
}

impl Throttler {
    pub fn new(
        backend: Box<dyn DivertBackend>,
        process_utils: Arc<dyn ProcessUtils>,
        focus: FocusSelector,
        settings: ThrottlerSettings,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        let throttle_set = ThrottleSet::new();
        let rate = Arc::new(AtomicU64::new(settings.rate_bytes_per_sec));
        let interceptor = Interceptor::new(
            backend,
            process_utils.clone(),
            throttle_set.clone(),
            rate.clone(),
            settings.connection_cache,
            status.clone(),
        );

        Self {
            interceptor,
            process_utils,
            throttle_set,
            rate,
            fixed: FixedSelector::new(settings.fixed_target),
            focus,
            target_mode: settings.target_mode,
            status,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if let Err(e) = self.interceptor.start() {
            self.status.notify(&format!("Error: {:#}", e), Severity::Error);
            return Err(e);
        }
        self.status.notify(
            &format!("Running, shaping at {}", format_rate(self.rate())),
            Severity::Info,
        );
        Ok(())
    }

    /// Stop intercepting and forget every throttled process
    pub fn stop(&mut self) {
        let was_running = self.interceptor.is_running();
        let finished = self.interceptor.stop();
        self.throttle_set.clear();
        if !finished {
            self.status.notify("Stopping after the packet being shaped", Severity::Warning);
        } else if was_running {
            self.status.notify("Stopped", Severity::Info);
        }
    }

    pub fn is_running(&self) -> bool {
        self.interceptor.is_running()
    }

    /// Throttle the current target's process group, or release it if its root
    /// is already throttled.
    pub fn toggle(&self) -> Result<ToggleOutcome> {
        let Some(root) = self.selector().root_pid() else {
            let message = match self.target_mode {
                TargetMode::Fixed => "Target PID not set!",
                TargetMode::Focus => "No focused window to throttle",
            };
            self.status.notify(message, Severity::Warning);
            return Err(anyhow!(message));
        };
        Ok(self.toggle_root(root))
    }

    fn toggle_root(&self, root: i32) -> ToggleOutcome {
        let group = self.current_group(root);
        let name = self
            .process_utils
            .get_process_name(root)
            .unwrap_or_else(|_| format!("PID {}", root));
        let mut pids: Vec<i32> = group.iter().copied().collect();
        pids.sort_unstable();

        if self.throttle_set.contains(root) {
            self.throttle_set.remove_group(&group);
            self.status
                .notify(&format!("Unthrottled {}", name), Severity::Unthrottled);
            ToggleOutcome::Unthrottled { root, name, pids }
        } else {
            self.throttle_set.add_group(&group);
            self.status
                .notify(&format!("Throttling {}", name), Severity::Throttled);
            ToggleOutcome::Throttled { root, name, pids }
        }
    }

    fn current_group(&self, root: i32) -> HashSet<i32> {
        match self.process_utils.get_all_processes() {
            Ok(processes) => process_group(&processes, root),
            Err(e) => {
                log::debug!("Process table unavailable, toggling PID {} alone: {:#}", root, e);
                HashSet::from([root])
            }
        }
    }

    fn selector(&self) -> &dyn TargetSelector {
        match self.target_mode {
            TargetMode::Focus => &self.focus,
            TargetMode::Fixed => &self.fixed,
        }
    }

    /// Takes effect from the next packet
    pub fn set_rate(&self, bytes_per_sec: u64) {
        self.rate.store(bytes_per_sec, Ordering::Relaxed);
        log::debug!("Rate set to {}", format_rate(bytes_per_sec));
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    pub fn set_fixed_target(&self, pid: Option<i32>) {
        self.fixed.set(pid);
        match pid {
            Some(pid) => log::info!("Target set to PID {}", pid),
            None => log::info!("Target cleared"),
        }
    }

    pub fn fixed_target(&self) -> Option<i32> {
        self.fixed.get()
    }

    pub fn set_target_mode(&mut self, mode: TargetMode) {
        if mode == TargetMode::Focus && self.focus.provider_name().is_none() {
            self.status.notify(
                "No foreground window provider, focus mode cannot find targets",
                Severity::Warning,
            );
        }
        self.target_mode = mode;
    }

    pub fn target_mode(&self) -> TargetMode {
        self.target_mode
    }

    pub fn throttled_pids(&self) -> Vec<i32> {
        self.throttle_set.snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.interceptor.stats()
    }

    pub fn divert_backend_name(&self) -> &'static str {
        self.interceptor.backend_name()
    }

    pub fn socket_mapper_name(&self) -> &str {
        self.process_utils.socket_mapper_name()
    }

    pub fn process_name(&self, pid: i32) -> Option<String> {
        self.process_utils.get_process_name(pid).ok()
    }

    /// Picker entries, "name (PID: n)" to PID
    pub fn running_processes(&self) -> Result<BTreeMap<String, i32>> {
        running_processes(self.process_utils.as_ref())
    }
}

impl Drop for Throttler {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn running_processes(process_utils: &dyn ProcessUtils) -> Result<BTreeMap<String, i32>> {
    Ok(process_utils
        .get_all_processes()?
        .into_iter()
        .filter(|p| p.pid > 0)
        .map(|p| (format!("{} (PID: {})", p.name, p.pid), p.pid))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::divert::DivertHandle;
    use crate::backends::focus::ForegroundProvider;
    use crate::backends::BackendPriority;
    use crate::resolver::tests::FakeProcessUtils;
    use crate::status::tests::CollectingSink;

    /// Never opens; toggling does not need a running capture
    struct NoDriver;

    impl DivertBackend for NoDriver {
        fn name(&self) -> &'static str {
            "none"
        }

        fn priority(&self) -> BackendPriority {
            BackendPriority::Fallback
        }

        fn is_available() -> bool {
            false
        }

        fn open(&self, _filter: &str) -> Result<Box<dyn DivertHandle>> {
            Err(anyhow!("driver not installed"))
        }
    }

    struct Focused(i32);

    impl ForegroundProvider for Focused {
        fn name(&self) -> &'static str {
            "focused"
        }

        fn priority(&self) -> BackendPriority {
            BackendPriority::Good
        }

        fn is_available() -> bool {
            true
        }

        fn foreground_pid(&self) -> Option<i32> {
            Some(self.0)
        }
    }

    fn throttler(
        utils: FakeProcessUtils,
        focus: FocusSelector,
        fixed_target: Option<i32>,
    ) -> (Throttler, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        let throttler = Throttler::new(
            Box::new(NoDriver),
            Arc::new(utils),
            focus,
            ThrottlerSettings {
                rate_bytes_per_sec: 10 * 1024,
                target_mode: TargetMode::Fixed,
                fixed_target,
                connection_cache: Duration::ZERO,
            },
            sink.clone(),
        );
        (throttler, sink)
    }

    fn browser_tree() -> FakeProcessUtils {
        FakeProcessUtils::with_processes(&[
            (1, None, "init"),
            (100, Some(1), "firefox"),
            (101, Some(100), "firefox-tab"),
            (102, Some(100), "firefox-gpu"),
            (200, Some(1), "game"),
        ])
    }

    #[test]
    fn test_toggle_throttles_then_releases_group() {
        let (throttler, sink) = throttler(browser_tree(), FocusSelector::new(None), Some(100));

        let outcome = throttler.toggle().unwrap();
        assert_eq!(
            outcome,
            ToggleOutcome::Throttled {
                root: 100,
                name: "firefox".to_string(),
                pids: vec![100, 101, 102],
            }
        );
        assert_eq!(throttler.throttled_pids(), vec![100, 101, 102]);
        assert_eq!(
            sink.last(),
            Some(("Throttling firefox".to_string(), Severity::Throttled))
        );

        let outcome = throttler.toggle().unwrap();
        assert!(matches!(outcome, ToggleOutcome::Unthrottled { root: 100, .. }));
        assert!(throttler.throttled_pids().is_empty());
        assert_eq!(
            sink.last(),
            Some(("Unthrottled firefox".to_string(), Severity::Unthrottled))
        );
    }

    #[test]
    fn test_double_toggle_restores_set() {
        let (throttler, _sink) = throttler(browser_tree(), FocusSelector::new(None), Some(200));
        throttler.set_fixed_target(Some(100));
        throttler.toggle().unwrap();
        let before = throttler.throttled_pids();

        throttler.set_fixed_target(Some(200));
        throttler.toggle().unwrap();
        throttler.toggle().unwrap();
        assert_eq!(throttler.throttled_pids(), before);
    }

    #[test]
    fn test_toggle_without_target_warns() {
        let (throttler, sink) = throttler(browser_tree(), FocusSelector::new(None), None);

        assert!(throttler.toggle().is_err());
        assert!(throttler.throttled_pids().is_empty());
        assert_eq!(sink.severities(), vec![Severity::Warning]);
    }

    #[test]
    fn test_toggle_exited_root_as_singleton() {
        let (throttler, _sink) = throttler(browser_tree(), FocusSelector::new(None), Some(4242));

        let outcome = throttler.toggle().unwrap();
        assert_eq!(
            outcome,
            ToggleOutcome::Throttled {
                root: 4242,
                name: "PID 4242".to_string(),
                pids: vec![4242],
            }
        );
    }

    #[test]
    fn test_focus_mode_uses_foreground_window() {
        let focus = FocusSelector::new(Some(Box::new(Focused(200))));
        let (mut throttler, sink) = throttler(browser_tree(), focus, Some(100));
        throttler.set_target_mode(TargetMode::Focus);

        throttler.toggle().unwrap();
        assert_eq!(throttler.throttled_pids(), vec![200]);
        assert_eq!(sink.severities(), vec![Severity::Throttled]);
    }

    #[test]
    fn test_focus_mode_without_provider_warns() {
        let (mut throttler, sink) = throttler(browser_tree(), FocusSelector::new(None), Some(100));
        throttler.set_target_mode(TargetMode::Focus);

        assert!(throttler.toggle().is_err());
        assert!(throttler.throttled_pids().is_empty());
        assert_eq!(sink.severities(), vec![Severity::Warning, Severity::Warning]);
    }

    #[test]
    fn test_start_failure_reports_error() {
        let (mut throttler, sink) = throttler(browser_tree(), FocusSelector::new(None), Some(100));

        assert!(throttler.start().is_err());
        assert!(!throttler.is_running());
        let (message, severity) = sink.last().unwrap();
        assert_eq!(severity, Severity::Error);
        assert!(message.contains("driver not installed"));
    }

    #[test]
    fn test_stop_clears_throttle_set() {
        let (mut throttler, _sink) = throttler(browser_tree(), FocusSelector::new(None), Some(100));
        throttler.toggle().unwrap();
        throttler.stop();
        assert!(throttler.throttled_pids().is_empty());
    }

    #[test]
    fn test_rate_is_shared() {
        let (throttler, _sink) = throttler(browser_tree(), FocusSelector::new(None), None);
        throttler.set_rate(2048);
        assert_eq!(throttler.rate(), 2048);
    }

    #[test]
    fn test_running_processes_labels() {
        let processes = running_processes(&browser_tree()).unwrap();
        assert_eq!(processes.get("firefox (PID: 100)"), Some(&100));
        assert_eq!(processes.len(), 5);
    }
}
