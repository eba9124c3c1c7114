use std::sync::{Arc, RwLock};

use crate::config::HostConfig;
use crate::error::{ErrorKind, PassThruError, Result};
use crate::j2534::device::DeviceDescriptor;
use crate::j2534::Backend;
use crate::session::Session;

/// Shared state behind every command: the device backend and at most one open session
pub struct AppState {
    backend: Box<dyn Backend>,
    config: HostConfig,
    session: RwLock<Option<Arc<Session>>>,
}

impl AppState {
    pub fn new(backend: impl Backend + 'static, config: HostConfig) -> Self {
        Self {
            backend: Box::new(backend),
            config,
            session: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.backend.list_devices()?)
    }

    pub fn is_open(&self) -> bool {
        self.session.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Load the descriptor's driver and open the device. Nothing changes on failure.
    pub fn open(&self, descriptor: DeviceDescriptor) -> Result<Arc<Session>> {
        let mut slot = self.session.write()?;
        if slot.is_some() {
            return Err(ErrorKind::AlreadyOpen.into());
        }
        let driver = self.backend.load(&descriptor)?;
        let session = Arc::new(Session::open(descriptor, driver)?);
        *slot = Some(session.clone());
        Ok(session)
    }

    /// The open session, or `NotOpen`
    pub fn session(&self) -> Result<Arc<Session>> {
        self.session
            .read()?
            .clone()
            .ok_or_else(|| ErrorKind::NotOpen.into())
    }

    /// Close the open session. Busy sessions are left alone.
    pub fn close(&self) -> Result<()> {
        let session = self.session()?;
        session.close()?;
        let mut slot = self.session.write()?;
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, &session)) {
            *slot = None;
        }
        Ok(())
    }

    /// Drop the session even if its lock is stuck
    pub fn force_close(&self) -> Result<()> {
        let session = self
            .session
            .write()?
            .take()
            .ok_or_else(|| PassThruError::from(ErrorKind::NotOpen))?;
        session.force_close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::j2534::mock::{mock_descriptor, MockBackend, MockOp};
    use crate::j2534::types::*;

    fn state_with(backend: MockBackend) -> AppState {
        AppState::new(backend, HostConfig::default())
    }

    #[test]
    fn test_empty_enumeration() {
        let state = state_with(MockBackend::new(Vec::new()));
        assert!(state.list_devices().unwrap().is_empty());
        assert!(!state.is_open());
    }

    #[test]
    fn test_double_open() {
        let state = state_with(MockBackend::new(vec![mock_descriptor("a")]));
        state.open(mock_descriptor("a")).unwrap();
        let err = state.open(mock_descriptor("a")).err().unwrap();
        assert_eq!(err.kind, ErrorKind::AlreadyOpen);
        assert_eq!(state.session().unwrap().descriptor().name, "a");
    }

    #[test]
    fn test_not_open() {
        let state = state_with(MockBackend::new(Vec::new()));
        assert_eq!(state.session().err().unwrap().kind, ErrorKind::NotOpen);
        assert_eq!(state.close().unwrap_err().kind, ErrorKind::NotOpen);
        assert_eq!(state.force_close().unwrap_err().kind, ErrorKind::NotOpen);
    }

    #[test]
    fn test_open_failure_leaves_state_closed() {
        let mut backend = MockBackend::new(Vec::new());
        backend.fail_load = true;
        let state = state_with(backend);
        let err = state.open(mock_descriptor("x")).err().unwrap();
        assert_eq!(err.kind, ErrorKind::LibraryLoad);
        assert!(!state.is_open());

        let backend = MockBackend::new(Vec::new());
        backend.driver.fail_next(MockOp::Open, J2534Error::DeviceNotConnected);
        let state = state_with(backend);
        let err = state.open(mock_descriptor("x")).err().unwrap();
        assert_eq!(err.kind, ErrorKind::DeviceNotConnected);
        assert!(!state.is_open());
    }

    #[test]
    fn test_close_while_busy_then_after_release() {
        let state = state_with(MockBackend::new(Vec::new()));
        let session = state.open(mock_descriptor("a")).unwrap();

        let guard = session.acquire().unwrap();
        assert_eq!(state.close().unwrap_err().kind, ErrorKind::DeviceBusy);
        assert!(state.is_open());

        drop(guard);
        state.close().unwrap();
        assert!(!state.is_open());
        // A new session can be opened afterwards
        state.open(mock_descriptor("a")).unwrap();
    }

    #[test]
    fn test_force_close_clears_stuck_session() {
        let backend = MockBackend::new(Vec::new());
        let driver = backend.driver.clone();
        let state = state_with(backend);
        let session = state.open(mock_descriptor("a")).unwrap();
        std::mem::forget(session.acquire().unwrap());

        assert_eq!(state.close().unwrap_err().kind, ErrorKind::DeviceBusy);
        state.force_close().unwrap();
        assert!(!state.is_open());
        assert!(!driver.is_open());
    }
}
