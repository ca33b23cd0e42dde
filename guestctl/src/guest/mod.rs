//! The guest as seen from the host.
//!
//! [`Guest`] owns the session table, what the Guest Additions reported
//! about themselves (version, OS, features) and the facility table. Guest
//! callbacks enter here and are routed to the session named in their
//! context ID.

pub mod facility;
pub mod iso;
pub mod update;

pub use facility::{Facility, FacilityEvent, FacilityStatus, FacilityType, RunLevel};
pub use iso::{IsoEntry, IsoImage};
pub use update::AdditionsUpdateFlags;

use crate::channel::GuestChannel;
use crate::config::GuestctlOptions;
use crate::session::{Session, SessionCredentials, SessionSetup};
use chrono::{DateTime, Utc};
use facility::FacilityTable;
use futures::future::join_all;
use guestctl_shared::constants::{context, properties, protocol};
use guestctl_shared::errors::{GuestErrorKind, GuestRc, GuestctlError, GuestctlResult};
use guestctl_shared::flags::GuestFeatures;
use guestctl_shared::protocol::GuestCallback;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;

const FACILITY_EVENT_CAPACITY: usize = 64;

// ============================================================================
// Guest description
// ============================================================================

/// Operating system family of the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GuestOsType {
    #[default]
    Unknown,
    Windows,
    Linux,
    Solaris,
    Other,
}

impl GuestOsType {
    /// Map the OS product string the guest reports.
    pub fn from_product(product: &str) -> Self {
        let product = product.to_ascii_lowercase();
        if product.is_empty() {
            Self::Unknown
        } else if product.contains("windows") {
            Self::Windows
        } else if product.contains("linux") {
            Self::Linux
        } else if product.contains("sunos") || product.contains("solaris") {
            Self::Solaris
        } else {
            Self::Other
        }
    }

    pub fn is_windows(&self) -> bool {
        matches!(self, Self::Windows)
    }
}

/// Guest Additions version as reported by the guest, e.g. `4.3.12r93733`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AdditionsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl AdditionsVersion {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision: 0,
        }
    }

    pub fn triple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.build)
    }

    /// Guest control protocol these Additions speak.
    pub fn protocol_version(&self) -> u32 {
        if self.triple() >= protocol::SESSIONS_MIN_ADDITIONS {
            protocol::VERSION_SESSIONS
        } else {
            protocol::VERSION_LEGACY
        }
    }
}

impl FromStr for AdditionsVersion {
    type Err = GuestctlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || GuestctlError::InvalidArgument(format!("invalid Guest Additions version \"{}\"", s));

        let numeric_end = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let mut parts = s[..numeric_end].split('.');
        let mut next = || -> GuestctlResult<u32> {
            match parts.next() {
                Some(p) if !p.is_empty() => p.parse().map_err(|_| invalid()),
                Some(_) => Err(invalid()),
                None => Ok(0),
            }
        };
        let major = next()?;
        let minor = next()?;
        let build = next()?;

        let revision = s[numeric_end..]
            .rsplit_once('r')
            .and_then(|(_, rev)| rev.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            major,
            minor,
            build,
            revision,
        })
    }
}

impl fmt::Display for AdditionsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)?;
        if self.revision != 0 {
            write!(f, "r{}", self.revision)?;
        }
        Ok(())
    }
}

// ============================================================================
// Guest
// ============================================================================

struct GuestState {
    sessions: BTreeMap<u32, Session>,
    /// Where the next session ID scan starts.
    next_session_id: u32,
    properties: HashMap<String, String>,
    additions_version: Option<AdditionsVersion>,
    os_type: GuestOsType,
    features: GuestFeatures,
}

pub(crate) struct GuestInner {
    options: Arc<GuestctlOptions>,
    channel: Arc<dyn GuestChannel>,
    state: RwLock<GuestState>,
    facilities: Mutex<FacilityTable>,
    facility_events: broadcast::Sender<FacilityEvent>,
}

impl GuestInner {
    /// Drop a session from the table and release its objects.
    pub(crate) fn session_destroy(&self, id: u32) {
        let removed = self.state.write().sessions.remove(&id);
        match removed {
            Some(session) => {
                tracing::debug!(session_id = id, "Removed guest session");
                session.teardown();
            }
            None => tracing::trace!(session_id = id, "Session already removed"),
        }
    }
}

/// Handle to a guest. Cheap to clone.
#[derive(Clone)]
pub struct Guest {
    inner: Arc<GuestInner>,
}

impl fmt::Debug for Guest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Guest")
            .field("additions_version", &state.additions_version)
            .field("os_type", &state.os_type)
            .field("sessions", &state.sessions.len())
            .finish()
    }
}

impl Guest {
    pub fn new(channel: Arc<dyn GuestChannel>, options: GuestctlOptions) -> GuestctlResult<Self> {
        options.validate()?;
        let (facility_events, _) = broadcast::channel(FACILITY_EVENT_CAPACITY);
        let facilities = FacilityTable::new(options.max_facilities);
        Ok(Self {
            inner: Arc::new(GuestInner {
                options: Arc::new(options),
                channel,
                state: RwLock::new(GuestState {
                    sessions: BTreeMap::new(),
                    next_session_id: 0,
                    properties: HashMap::new(),
                    additions_version: None,
                    os_type: GuestOsType::Unknown,
                    features: GuestFeatures::empty(),
                }),
                facilities: Mutex::new(facilities),
                facility_events,
            }),
        })
    }

    pub fn options(&self) -> &GuestctlOptions {
        &self.inner.options
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    /// Record a guest property. The Additions version and OS product are
    /// also parsed.
    pub fn set_property(&self, name: &str, value: &str) -> GuestctlResult<()> {
        let version = if name == properties::ADDITIONS_VERSION {
            Some(value.parse::<AdditionsVersion>()?)
        } else {
            None
        };

        let mut state = self.inner.state.write();
        if let Some(version) = version {
            tracing::info!(%version, protocol = version.protocol_version(), "Guest Additions version reported");
            state.additions_version = Some(version);
        }
        if name == properties::OS_PRODUCT {
            state.os_type = GuestOsType::from_product(value);
            tracing::debug!(product = value, os_type = ?state.os_type, "Guest OS reported");
        }
        state.properties.insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn property(&self, name: &str) -> Option<String> {
        self.inner.state.read().properties.get(name).cloned()
    }

    pub fn additions_version(&self) -> Option<AdditionsVersion> {
        self.inner.state.read().additions_version
    }

    /// Protocol spoken with the guest; legacy while the version is unknown.
    pub fn protocol_version(&self) -> u32 {
        self.additions_version()
            .map(|v| v.protocol_version())
            .unwrap_or(protocol::VERSION_LEGACY)
    }

    pub fn os_type(&self) -> GuestOsType {
        self.inner.state.read().os_type
    }

    pub fn set_features(&self, features: GuestFeatures) {
        tracing::debug!(?features, "Guest features reported");
        self.inner.state.write().features = features;
    }

    pub fn features(&self) -> GuestFeatures {
        self.inner.state.read().features
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Create a session. It still has to be started.
    pub fn create_session(&self, credentials: SessionCredentials, name: &str) -> GuestctlResult<Session> {
        let max = self.inner.options.max_sessions.min(context::MAX_SESSIONS);
        let protocol = self.protocol_version();

        let mut state = self.inner.state.write();
        let id = (0..max)
            .map(|offset| (state.next_session_id + offset) % max)
            .find(|id| !state.sessions.contains_key(id))
            .ok_or_else(|| {
                tracing::warn!(max, "No free session ID");
                GuestctlError::guest(GuestErrorKind::Session, GuestRc::MAX_OBJECTS_REACHED, name)
            })?;

        let session = Session::new(SessionSetup {
            id,
            name: name.to_string(),
            credentials,
            protocol,
            os_type: state.os_type,
            features: state.features,
            options: self.inner.options.clone(),
            channel: self.inner.channel.clone(),
            parent: Arc::downgrade(&self.inner),
        })?;
        state.sessions.insert(id, session.clone());
        state.next_session_id = (id + 1) % max;
        drop(state);

        tracing::info!(session_id = id, name, protocol, "Guest session created");
        Ok(session)
    }

    pub fn session(&self, id: u32) -> Option<Session> {
        self.inner.state.read().sessions.get(&id).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.state.read().sessions.values().cloned().collect()
    }

    /// Find sessions by name.
    pub fn find_sessions(&self, name: &str) -> Vec<Session> {
        self.inner
            .state
            .read()
            .sessions
            .values()
            .filter(|s| s.name() == name)
            .cloned()
            .collect()
    }

    /// Route a guest callback to the session its context ID names.
    pub fn dispatch(&self, callback: GuestCallback) -> GuestctlResult<()> {
        let session_id = callback.cid().session_id();
        let session = self.session(session_id).ok_or_else(|| {
            tracing::debug!(session_id, cid = %callback.cid(), "Callback for unknown session");
            GuestctlError::NotFound(format!("no session with ID {}", session_id))
        })?;
        session.dispatch(callback)
    }

    /// Close every session. Failures are logged; all sessions end up removed.
    pub async fn close_sessions(&self) {
        let sessions = self.sessions();
        let results = join_all(sessions.iter().map(|s| s.close())).await;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(session_id = session.id(), error = %e, "Closing session failed");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Facilities
    // ------------------------------------------------------------------------

    /// Apply a facility status report from the guest.
    pub fn facility_update(
        &self,
        kind: FacilityType,
        status: FacilityStatus,
        flags: u32,
        timestamp: DateTime<Utc>,
    ) -> GuestctlResult<()> {
        let events = self.inner.facilities.lock().update(kind, status, flags, timestamp)?;
        for event in events {
            // Nobody listening is fine.
            let _ = self.inner.facility_events.send(event);
        }
        Ok(())
    }

    pub fn facility_status(&self, kind: FacilityType) -> FacilityStatus {
        self.inner
            .facilities
            .lock()
            .get(kind)
            .map(|f| f.status)
            .unwrap_or_default()
    }

    pub fn facilities(&self) -> Vec<Facility> {
        self.inner.facilities.lock().all()
    }

    pub fn additions_run_level(&self) -> RunLevel {
        self.inner.facilities.lock().run_level()
    }

    pub fn subscribe_facilities(&self) -> broadcast::Receiver<FacilityEvent> {
        self.inner.facility_events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_additions_version_parse() {
        let v: AdditionsVersion = "4.3.12r93733".parse().unwrap();
        assert_eq!(v.triple(), (4, 3, 12));
        assert_eq!(v.revision, 93733);
        assert_eq!(v.protocol_version(), protocol::VERSION_SESSIONS);
        assert_eq!(v.to_string(), "4.3.12r93733");

        let v: AdditionsVersion = "6.1.0_BETA2r140000".parse().unwrap();
        assert_eq!(v.triple(), (6, 1, 0));
        assert_eq!(v.revision, 140000);

        let v: AdditionsVersion = "4.2".parse().unwrap();
        assert_eq!(v.triple(), (4, 2, 0));
        assert_eq!(v.revision, 0);
        assert_eq!(v.protocol_version(), protocol::VERSION_LEGACY);

        assert!("abc".parse::<AdditionsVersion>().is_err());
        assert!("4..1".parse::<AdditionsVersion>().is_err());
    }

    #[test]
    fn test_os_type_from_product() {
        assert_eq!(GuestOsType::from_product("Windows XP"), GuestOsType::Windows);
        assert_eq!(GuestOsType::from_product("Linux"), GuestOsType::Linux);
        assert_eq!(GuestOsType::from_product("SunOS"), GuestOsType::Solaris);
        assert_eq!(GuestOsType::from_product("FreeBSD"), GuestOsType::Other);
        assert_eq!(GuestOsType::from_product(""), GuestOsType::Unknown);
        assert!(GuestOsType::Windows.is_windows());
    }
}
