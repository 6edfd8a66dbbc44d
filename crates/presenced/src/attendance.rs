//! Verify-and-record: the attendance check-in flow.

use crate::engine::{EngineError, FaceIdentifier};
use crate::gate::{match_identity, Clock, GateError, TimeWindow};
use crate::store::{timed, AttendanceLedger, AttendanceRecord, StoreError, UserDirectory};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// What to do when a verified user checks in more than once a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresentPolicy {
    /// Every verified request appends a present record.
    #[default]
    AppendAlways,
    /// Only the first verified request of the local day is recorded.
    FirstPerDay,
}

impl FromStr for PresentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" | "append-always" => Ok(Self::AppendAlways),
            "first-per-day" => Ok(Self::FirstPerDay),
            other => Err(format!("unknown present policy {other:?} (expected append|first-per-day)")),
        }
    }
}

/// Business reason a check-in was not recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    NoFaceDetected,
    UnknownUser,
    IdentityMismatch,
    TimeWindow,
    LedgerWrite,
}

/// Closed result of one verify-and-record request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Recorded {
        prediction: String,
        message: String,
    },
    Rejected {
        kind: FailureKind,
        message: String,
        /// Set only when the identity matched but recording failed.
        prediction: Option<String>,
    },
    /// Unexpected system fault; `message` is for logs, not clients.
    Failed { message: String },
}

impl Outcome {
    fn rejected(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Rejected {
            kind,
            message: message.into(),
            prediction: None,
        }
    }
}

pub struct AttendanceService {
    identifier: Arc<dyn FaceIdentifier>,
    users: Arc<dyn UserDirectory>,
    ledger: Arc<dyn AttendanceLedger>,
    clock: Arc<dyn Clock>,
    window: TimeWindow,
    policy: PresentPolicy,
    store_timeout: Duration,
    /// Serializes present writes with the absentee sweep.
    writer: Arc<Mutex<()>>,
}

impl AttendanceService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identifier: Arc<dyn FaceIdentifier>,
        users: Arc<dyn UserDirectory>,
        ledger: Arc<dyn AttendanceLedger>,
        clock: Arc<dyn Clock>,
        window: TimeWindow,
        policy: PresentPolicy,
        store_timeout: Duration,
        writer: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            identifier,
            users,
            ledger,
            clock,
            window,
            policy,
            store_timeout,
            writer,
        }
    }

    pub fn models_loaded(&self) -> bool {
        self.identifier.models_loaded()
    }

    /// Check the claimed identity against the photo and record presence.
    pub async fn verify_and_record(&self, image: Vec<u8>, user_id: &str) -> Outcome {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Outcome::rejected(FailureKind::Validation, "user_id is required");
        }
        if image.is_empty() {
            return Outcome::rejected(FailureKind::Validation, "image is required");
        }

        let now = self.clock.now();
        if let Err(e) = self.window.check(now) {
            tracing::info!(user_id, "check-in outside attendance window");
            return Outcome::rejected(FailureKind::TimeWindow, e.to_string());
        }

        let prediction = match self.identifier.identify(image).await {
            Ok(id) => id.label,
            Err(EngineError::NoFaceDetected) => {
                tracing::info!(user_id, "no face detected");
                return Outcome::rejected(FailureKind::NoFaceDetected, "No face detected in the image");
            }
            Err(EngineError::Decode(e)) => {
                tracing::info!(user_id, error = %e, "undecodable upload");
                return Outcome::rejected(FailureKind::Validation, e.to_string());
            }
            Err(e) => {
                tracing::error!(user_id, error = %e, "identification failed");
                return Outcome::Failed { message: e.to_string() };
            }
        };

        let expected = match timed(self.store_timeout, self.users.username_of(user_id)).await {
            Ok(Some(username)) => username,
            Ok(None) => {
                tracing::info!(user_id, "unknown user");
                return Outcome::rejected(
                    FailureKind::UnknownUser,
                    GateError::UnknownUser(user_id.to_string()).to_string(),
                );
            }
            Err(e) => {
                tracing::error!(user_id, error = %e, "user lookup failed");
                return Outcome::Failed { message: e.to_string() };
            }
        };

        if let Err(e) = match_identity(&prediction, &expected) {
            tracing::info!(user_id, %prediction, reason = %e, "claimed identity rejected");
            return Outcome::rejected(FailureKind::IdentityMismatch, "Face does not match with user");
        }

        let _guard = self.writer.lock().await;
        match self.record_present(user_id, now).await {
            Ok(Some(record)) => {
                tracing::info!(user_id, %prediction, record_id = %record.id, "attendance recorded");
                Outcome::Recorded {
                    prediction,
                    message: format!("Attendance recorded at {}", record.timestamp.to_rfc3339()),
                }
            }
            Ok(None) => {
                tracing::info!(user_id, %prediction, "already checked in today");
                Outcome::Recorded {
                    prediction,
                    message: "Attendance already recorded today".to_string(),
                }
            }
            Err(e) => {
                tracing::warn!(user_id, %prediction, error = %e, "attendance write failed");
                Outcome::Rejected {
                    kind: FailureKind::LedgerWrite,
                    message: "Attendance could not be recorded".to_string(),
                    prediction: Some(prediction),
                }
            }
        }
    }

    /// Append a present record per the policy. `None` means it was skipped.
    async fn record_present(
        &self,
        user_id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        if self.policy == PresentPolicy::FirstPerDay {
            let since = self.window.start_of_day(now);
            if timed(self.store_timeout, self.ledger.has_present_since(user_id, since)).await? {
                return Ok(None);
            }
        }
        timed(self.store_timeout, self.ledger.write_present(user_id, now))
            .await
            .map(Some)
    }

    pub async fn list_attendance(&self, user_id: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        timed(self.store_timeout, self.ledger.list_by_user(user_id)).await
    }

    pub async fn username_exists(&self, username: &str) -> Result<bool, StoreError> {
        timed(self.store_timeout, self.users.username_exists(username)).await
    }
}
