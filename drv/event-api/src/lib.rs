// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the event reporter service.
//!
//! Events are advisory observability signals; every service on the HAT
//! publishes them but none of them depends on the reporter being up. The
//! reporter owns uploading, batching, and disk spooling; our only job is
//! to hand it a timestamped JSON blob and walk away. Publication therefore
//! never blocks a request path and never surfaces an error to the caller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use dbus::blocking::Connection;
use serde::Serialize;

pub const EVENTS_BUS_NAME: &str = "org.cacophony.Events";
pub const EVENTS_OBJECT_PATH: &str = "/org/cacophony/Events";
pub const EVENTS_INTERFACE: &str = "org.cacophony.Events";

/// Call timeout for the reporter. Generous because the reporter may be
/// fsyncing its spool, but bounded so a hung reporter can't pile up
/// publisher threads forever.
const ADD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "i2cBusyPinTimeout")]
    I2cBusyPinTimeout,
    #[serde(rename = "rtcIntegrityLost")]
    RtcIntegrityLost,
    #[serde(rename = "rtcIntegrityError")]
    RtcIntegrityError,
    #[serde(rename = "rtcNtpDrift")]
    RtcNtpDrift,
    #[serde(rename = "rtcNtpDriftHigh")]
    RtcNtpDriftHigh,
    #[serde(rename = "rtcNotTicking")]
    RtcNotTicking,
    #[serde(rename = "tempHumidity")]
    TempHumidity,
    #[serde(rename = "tempTooHigh")]
    TempTooHigh,
    #[serde(rename = "tempTooLow")]
    TempTooLow,
    #[serde(rename = "humidityTooHigh")]
    HumidityTooHigh,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Severity {
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

#[derive(Clone, Debug, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub severity: Severity,
    pub timestamp: String,
    pub details: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, severity: Severity, details: serde_json::Value) -> Self {
        Self::at(Utc::now(), kind, severity, details)
    }

    pub fn at(
        when: DateTime<Utc>,
        kind: EventKind,
        severity: Severity,
        details: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            severity,
            timestamp: when.to_rfc3339_opts(SecondsFormat::Secs, true),
            details,
        }
    }
}

/// Where services hand their events. Swapped for a recording sink in tests.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Publishes to the reporter over the system bus, one short-lived thread
/// per event so callers never wait on D-Bus.
pub struct DbusReporter;

impl DbusReporter {
    pub fn new() -> Arc<dyn EventSink> {
        Arc::new(Self)
    }

    fn deliver(event: &Event) -> Result<(), dbus::Error> {
        let json = serde_json::to_string(event)
            .map_err(|e| dbus::Error::new_failed(&e.to_string()))?;
        let conn = Connection::new_system()?;
        let proxy = conn.with_proxy(EVENTS_BUS_NAME, EVENTS_OBJECT_PATH, ADD_TIMEOUT);
        proxy.method_call(EVENTS_INTERFACE, "Add", (json,))
    }
}

impl EventSink for DbusReporter {
    fn publish(&self, event: Event) {
        std::thread::spawn(move || {
            if let Err(e) = Self::deliver(&event) {
                log::warn!("event {:?} not delivered: {}", event.kind, e);
            }
        });
    }
}

/// Sink that drops everything. For services running with events disabled.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: Event) {}
}

/// Captures published events for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
