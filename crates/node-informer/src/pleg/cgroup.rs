//! Lifecycle source driven by pod cgroup directory creation.

use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::HandlerId;
use super::Handlers;
use super::PodAddedHandler;
use super::PodLifecycleSource;
use crate::error::InformerError;
use crate::pod_meta::qos_cgroup_dir;
use crate::pod_meta::parse_pod_uid;
use crate::pod_meta::CgroupDriver;
use crate::pod_meta::QosClass;

/// Cgroup subsystem whose hierarchy is watched for new pod directories.
const WATCHED_SUBSYSTEM: &str = "cpu";

pub struct CgroupPleg {
    cgroup_root: PathBuf,
    driver: CgroupDriver,
    handlers: Handlers,
}

impl CgroupPleg {
    pub fn new(cgroup_root: impl Into<PathBuf>, driver: CgroupDriver) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            driver,
            handlers: Handlers::default(),
        }
    }

    /// QoS tier directories that hold pod cgroups.
    pub fn watch_dirs(&self) -> Vec<PathBuf> {
        let base = self.cgroup_root.join(WATCHED_SUBSYSTEM);
        [QosClass::Guaranteed, QosClass::Burstable, QosClass::BestEffort]
            .into_iter()
            .map(|qos| base.join(qos_cgroup_dir(self.driver, qos)))
            .collect()
    }

    /// Watch the pod cgroup directories until cancelled.
    ///
    /// # Errors
    ///
    /// - [`InformerError::ConnectionFailed`] if the filesystem watcher cannot be
    ///   created
    #[tracing::instrument(skip_all, fields(root = %self.cgroup_root.display()))]
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<InformerError>> {
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    // receiver is gone once the loop below exits
                    let _ = fs_tx.send(event);
                }
                Err(e) => {
                    error!("Filesystem watch error: {e:?}");
                }
            },
            Config::default(),
        )
        .change_context(InformerError::ConnectionFailed {
            message: "Failed to create cgroup watcher".to_string(),
        })?;

        let mut watched = 0;
        for dir in self.watch_dirs() {
            match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => watched += 1,
                Err(e) => warn!(dir = %dir.display(), "failed to watch cgroup dir: {e}"),
            }
        }
        if watched == 0 {
            warn!("no pod cgroup directory could be watched, pod discovery relies on polling");
        }
        info!(watched, "cgroup lifecycle source started");

        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("cgroup lifecycle source shutdown requested");
                    break;
                }
                event = fs_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(&event),
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Dispatch `pod_added` for every pod cgroup directory created by `event`.
    pub fn handle_event(&self, event: &Event) {
        if !matches!(event.kind, EventKind::Create(_)) {
            return;
        }
        for path in &event.paths {
            let Some(pod_uid) = self.pod_uid_of(path) else {
                continue;
            };
            debug!(pod_uid = %pod_uid, "pod cgroup created");
            self.handlers.dispatch(&pod_uid);
        }
    }

    fn pod_uid_of(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        parse_pod_uid(self.driver, name)
    }
}

impl PodLifecycleSource for CgroupPleg {
    fn add_handler(&self, handler: PodAddedHandler) -> HandlerId {
        self.handlers.add(handler)
    }

    fn remove_handler(&self, id: HandlerId) {
        self.handlers.remove(id);
    }
}
