//! presenced: face-verified attendance daemon.
//!
//! Hosts the identification pipeline behind an HTTP API, gates check-ins by
//! business hours and claimed identity, records them in an append-only
//! ledger, and marks absentees once a day.

pub mod api;
pub mod attendance;
pub mod config;
pub mod engine;
pub mod gate;
pub mod store;
pub mod sweeper;

pub use api::{build_router, AppState};
pub use attendance::{AttendanceService, FailureKind, Outcome, PresentPolicy};
pub use config::{Config, ConfigError};
pub use engine::{EngineError, EngineHandle, FaceIdentifier, Identification, Pipeline};
pub use gate::{Clock, FixedClock, SystemClock, TimeWindow};
pub use store::{AttendanceLedger, AttendanceRecord, AttendanceStatus, SqliteStore, StoreError, UserDirectory};
pub use sweeper::Sweeper;
