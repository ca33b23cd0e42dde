//! Guest Additions facility tracking.
//!
//! Facilities are the Additions' subsystems (driver, service, tray client,
//! ...). Their reported status determines the overall run level.

use chrono::{DateTime, Utc};
use guestctl_shared::errors::{GuestctlError, GuestctlResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FacilityType {
    Unknown,
    Driver,
    AutoLogon,
    Service,
    TrayClient,
    Seamless,
    Graphics,
    MonitorAttach,
    /// Addresses every tracked facility at once.
    All,
}

struct FacilityInfo {
    kind: FacilityType,
    name: &'static str,
}

static FACILITY_INFO: &[FacilityInfo] = &[
    FacilityInfo { kind: FacilityType::Unknown, name: "Unknown" },
    FacilityInfo { kind: FacilityType::Driver, name: "VirtualBox Base Driver" },
    FacilityInfo { kind: FacilityType::AutoLogon, name: "Auto Logon" },
    FacilityInfo { kind: FacilityType::Service, name: "VirtualBox System Service" },
    FacilityInfo { kind: FacilityType::TrayClient, name: "VirtualBox Desktop Integration" },
    FacilityInfo { kind: FacilityType::Seamless, name: "Seamless Mode" },
    FacilityInfo { kind: FacilityType::Graphics, name: "Graphics Mode" },
    FacilityInfo { kind: FacilityType::MonitorAttach, name: "Monitor Attach" },
    FacilityInfo { kind: FacilityType::All, name: "All Facilities" },
];

impl FacilityType {
    /// Descriptive name.
    pub fn name(&self) -> &'static str {
        FACILITY_INFO
            .iter()
            .find(|info| info.kind == *self)
            .map(|info| info.name)
            .unwrap_or("Unknown")
    }
}

impl fmt::Display for FacilityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FacilityStatus {
    #[default]
    Unknown,
    Inactive,
    Paused,
    PreInit,
    Init,
    Active,
    Terminating,
    Terminated,
    Failed,
}

/// Overall readiness of the Guest Additions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum RunLevel {
    #[default]
    None,
    System,
    Userland,
    Desktop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub kind: FacilityType,
    pub status: FacilityStatus,
    pub flags: u32,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacilityEvent {
    StatusChanged(Facility),
    RunLevelChanged { level: RunLevel },
}

#[derive(Debug)]
pub(crate) struct FacilityTable {
    max: usize,
    facilities: BTreeMap<FacilityType, Facility>,
    run_level: RunLevel,
}

impl FacilityTable {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            facilities: BTreeMap::new(),
            run_level: RunLevel::None,
        }
    }

    pub fn run_level(&self) -> RunLevel {
        self.run_level
    }

    pub fn get(&self, kind: FacilityType) -> Option<&Facility> {
        self.facilities.get(&kind)
    }

    pub fn all(&self) -> Vec<Facility> {
        self.facilities.values().cloned().collect()
    }

    /// Apply a status report and return the events it caused.
    pub fn update(
        &mut self,
        kind: FacilityType,
        status: FacilityStatus,
        flags: u32,
        timestamp: DateTime<Utc>,
    ) -> GuestctlResult<Vec<FacilityEvent>> {
        let mut events = Vec::new();

        if kind == FacilityType::All {
            for facility in self.facilities.values_mut() {
                if apply(facility, status, flags, timestamp) {
                    events.push(FacilityEvent::StatusChanged(facility.clone()));
                }
            }
        } else {
            if !self.facilities.contains_key(&kind) {
                if self.facilities.len() >= self.max {
                    tracing::warn!(facility = %kind, max = self.max, "Facility table full");
                    return Err(GuestctlError::MaxObjectsReached(self.max as u32));
                }
                self.facilities.insert(
                    kind,
                    Facility {
                        kind,
                        status: FacilityStatus::Unknown,
                        flags: 0,
                        last_updated: timestamp,
                    },
                );
            }
            if let Some(facility) = self.facilities.get_mut(&kind) {
                if apply(facility, status, flags, timestamp) {
                    events.push(FacilityEvent::StatusChanged(facility.clone()));
                }
            }
        }

        let level = self.compute_run_level();
        if level != self.run_level {
            tracing::info!(from = ?self.run_level, to = ?level, "Guest Additions run level changed");
            self.run_level = level;
            events.push(FacilityEvent::RunLevelChanged { level });
        }
        Ok(events)
    }

    fn is_active(&self, kind: FacilityType) -> bool {
        self.facilities
            .get(&kind)
            .is_some_and(|f| f.status == FacilityStatus::Active)
    }

    fn compute_run_level(&self) -> RunLevel {
        if self.is_active(FacilityType::TrayClient) {
            RunLevel::Desktop
        } else if self.is_active(FacilityType::Service) {
            RunLevel::Userland
        } else if self.is_active(FacilityType::Driver) {
            RunLevel::System
        } else {
            RunLevel::None
        }
    }
}

/// True if the status actually changed.
fn apply(facility: &mut Facility, status: FacilityStatus, flags: u32, timestamp: DateTime<Utc>) -> bool {
    facility.last_updated = timestamp;
    facility.flags = flags;
    if facility.status == status {
        return false;
    }
    tracing::debug!(facility = %facility.kind, from = ?facility.status, to = ?status, "Facility status changed");
    facility.status = status;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_level_precedence() {
        let mut table = FacilityTable::new(16);
        let now = Utc::now();
        table.update(FacilityType::Driver, FacilityStatus::Active, 0, now).unwrap();
        assert_eq!(table.run_level(), RunLevel::System);
        table.update(FacilityType::TrayClient, FacilityStatus::Active, 0, now).unwrap();
        assert_eq!(table.run_level(), RunLevel::Desktop);
        table.update(FacilityType::Service, FacilityStatus::Active, 0, now).unwrap();
        // Tray client still wins.
        assert_eq!(table.run_level(), RunLevel::Desktop);
        table.update(FacilityType::TrayClient, FacilityStatus::Terminated, 0, now).unwrap();
        assert_eq!(table.run_level(), RunLevel::Userland);
    }

    #[test]
    fn test_events_only_on_change() {
        let mut table = FacilityTable::new(16);
        let now = Utc::now();
        let events = table.update(FacilityType::Service, FacilityStatus::Active, 0, now).unwrap();
        assert_eq!(events.len(), 2);
        let events = table.update(FacilityType::Service, FacilityStatus::Active, 1, now).unwrap();
        assert!(events.is_empty());
        assert_eq!(table.get(FacilityType::Service).unwrap().flags, 1);
    }

    #[test]
    fn test_all_fans_out_to_tracked_facilities() {
        let mut table = FacilityTable::new(16);
        let now = Utc::now();
        table.update(FacilityType::Driver, FacilityStatus::Active, 0, now).unwrap();
        table.update(FacilityType::Graphics, FacilityStatus::Active, 0, now).unwrap();

        let events = table.update(FacilityType::All, FacilityStatus::Terminated, 0, now).unwrap();
        let changed = events
            .iter()
            .filter(|e| matches!(e, FacilityEvent::StatusChanged(_)))
            .count();
        assert_eq!(changed, 2);
        assert!(events.contains(&FacilityEvent::RunLevelChanged { level: RunLevel::None }));
        assert!(table.get(FacilityType::All).is_none());
    }

    #[test]
    fn test_table_capacity() {
        let mut table = FacilityTable::new(1);
        let now = Utc::now();
        table.update(FacilityType::Driver, FacilityStatus::Init, 0, now).unwrap();
        assert!(table.update(FacilityType::Service, FacilityStatus::Init, 0, now).is_err());
        assert_eq!(FacilityType::Service.name(), "VirtualBox System Service");
    }
}
