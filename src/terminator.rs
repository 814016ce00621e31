//! Forceful termination of script process trees.
use std::io;
use std::sync::{Arc, mpsc::Sender};
use std::thread;
use tracing::{debug, info};

use crate::platform::Platform;
use crate::registry::LaunchId;
use crate::supervisor::WorkerMessage;

/// What to kill, and how to find it.
#[derive(Debug, Clone)]
pub(crate) struct TerminateRequest {
    pub(crate) name: String,
    pub(crate) launch: LaunchId,
    pub(crate) recorded_pid: u32,
    pub(crate) port: Option<u16>,
}

/// Kills process trees off the coordination thread.
#[derive(Clone)]
pub struct ProcessTerminator {
    platform: Arc<dyn Platform>,
}

impl ProcessTerminator {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    /// Chooses the kill target: the listener on `port` when one is found,
    /// otherwise the recorded root PID.
    pub fn resolve_target(&self, name: &str, recorded_pid: u32, port: Option<u16>) -> u32 {
        let Some(port) = port else {
            return recorded_pid;
        };
        match self.platform.listener_pid(port) {
            Some(pid) => {
                info!("Resolved '{name}' to PID {pid} listening on port {port}");
                pid
            }
            None => {
                debug!("No listener on port {port}; using recorded PID {recorded_pid} for '{name}'");
                recorded_pid
            }
        }
    }

    /// Resolves the target and kills its tree on a worker thread. The outcome
    /// is reported back through `queue`.
    pub(crate) fn spawn(
        &self,
        request: TerminateRequest,
        queue: Sender<WorkerMessage>,
    ) -> io::Result<()> {
        let terminator = self.clone();
        thread::Builder::new()
            .name(format!("terminate-{}", request.name))
            .spawn(move || {
                let target =
                    terminator.resolve_target(&request.name, request.recorded_pid, request.port);
                let result = terminator.platform.kill_tree(target);
                let _ = queue.send(WorkerMessage::Terminated {
                    launch: request.launch,
                    name: request.name,
                    target,
                    result,
                });
            })
            .map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::TerminateError;
    use std::sync::{Mutex, mpsc};
    use std::time::Duration;

    /// Platform double recording kill targets.
    #[derive(Default)]
    pub(crate) struct RecordingPlatform {
        pub(crate) listener: Option<u32>,
        pub(crate) kills: Mutex<Vec<u32>>,
        pub(crate) gone: bool,
    }

    impl Platform for RecordingPlatform {
        fn listener_pid(&self, _port: u16) -> Option<u32> {
            self.listener
        }

        fn kill_tree(&self, pid: u32) -> Result<(), TerminateError> {
            self.kills.lock().unwrap().push(pid);
            if self.gone {
                Err(TerminateError::AlreadyGone { pid })
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn prefers_port_listener() {
        let platform = Arc::new(RecordingPlatform {
            listener: Some(4321),
            ..Default::default()
        });
        let terminator = ProcessTerminator::new(platform);
        assert_eq!(terminator.resolve_target("web", 10, Some(5000)), 4321);
        assert_eq!(terminator.resolve_target("web", 10, None), 10);
    }

    #[test]
    fn falls_back_to_recorded_pid() {
        let terminator = ProcessTerminator::new(Arc::new(RecordingPlatform::default()));
        assert_eq!(terminator.resolve_target("web", 10, Some(5000)), 10);
    }

    #[test]
    fn reports_outcome_through_queue() {
        let platform = Arc::new(RecordingPlatform {
            gone: true,
            ..Default::default()
        });
        let terminator = ProcessTerminator::new(platform.clone());
        let (tx, rx) = mpsc::channel();

        terminator
            .spawn(
                TerminateRequest {
                    name: "web".into(),
                    launch: 3,
                    recorded_pid: 77,
                    port: None,
                },
                tx,
            )
            .unwrap();

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerMessage::Terminated {
                launch,
                target,
                result,
                ..
            } => {
                assert_eq!(launch, 3);
                assert_eq!(target, 77);
                assert!(matches!(result, Err(TerminateError::AlreadyGone { pid: 77 })));
            }
            _ => panic!("expected a termination report"),
        }
        assert_eq!(*platform.kills.lock().unwrap(), vec![77]);
    }
}
