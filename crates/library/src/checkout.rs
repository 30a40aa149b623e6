//! Check-out workflow: tracks the due date of a checked-out book and
//! handles renewals.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use saga::prelude::*;
use saga::{DefinitionError, SagaDefinition};
use serde::{Deserialize, Serialize};

use crate::error::LibraryError;
use crate::messages::{
    CheckOutDueDateData, CheckOutNotFoundData, LibraryMessage, MemberCollectionData,
    NotifyMemberDueDateData,
};
use crate::value_objects::{BookId, CheckOutId, MemberId};

pub const SAGA_TYPE: &str = "CheckOut";

pub const CHECKED_OUT: &str = "CheckedOut";

/// Loan periods.
///
/// Reads from environment variables:
/// - `LIBRARY_CHECKOUT_DAYS`: days until a check-out is due (default: `14`)
/// - `LIBRARY_CHECKOUT_LIMIT_DAYS`: longest a check-out may last, renewals
///   included (default: `30`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutSettings {
    pub duration: TimeDelta,
    pub limit: TimeDelta,
}

impl CheckOutSettings {
    pub fn new(duration: TimeDelta, limit: TimeDelta) -> Self {
        Self { duration, limit }
    }

    /// Loads settings from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            duration: days_var("LIBRARY_CHECKOUT_DAYS").unwrap_or(defaults.duration),
            limit: days_var("LIBRARY_CHECKOUT_LIMIT_DAYS").unwrap_or(defaults.limit),
        }
    }
}

impl Default for CheckOutSettings {
    fn default() -> Self {
        Self {
            duration: TimeDelta::days(14),
            limit: TimeDelta::days(30),
        }
    }
}

fn days_var(name: &str) -> Option<TimeDelta> {
    let raw = std::env::var(name).ok()?;
    match u32::from_str(&raw) {
        Ok(days) => Some(TimeDelta::days(i64::from(days))),
        Err(e) => {
            tracing::warn!(var = name, value = %raw, error = %e, "ignoring invalid setting");
            None
        }
    }
}

/// Source of truth for library membership.
#[async_trait]
pub trait MemberRegistry: Send + Sync {
    async fn is_member_valid(&self, member_id: MemberId) -> Result<bool, LibraryError>;
}

/// Registry that accepts every member.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyMemberIsValid;

#[async_trait]
impl MemberRegistry for AnyMemberIsValid {
    async fn is_member_valid(&self, _member_id: MemberId) -> Result<bool, LibraryError> {
        Ok(true)
    }
}

/// Validates the member and tells them the due date.
///
/// Fails the dispatch if the registry rejects the member, so nothing is
/// stored or published.
pub struct NotifyMember {
    registry: Arc<dyn MemberRegistry>,
}

impl NotifyMember {
    pub fn new(registry: Arc<dyn MemberRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CustomActivity<CheckOut, LibraryMessage> for NotifyMember {
    async fn execute(
        &self,
        ctx: &mut BehaviorContext<'_, CheckOut, LibraryMessage>,
    ) -> Result<(), ActivityError> {
        let member_id = ctx.data().member_id;
        if !self.registry.is_member_valid(member_id).await? {
            return Err(LibraryError::InvalidMember(member_id).into());
        }

        let due_date = ctx.data().due_date;
        ctx.publish(LibraryMessage::NotifyMemberDueDate(NotifyMemberDueDateData {
            member_id,
            due_date,
        }));
        Ok(())
    }
}

/// Check-out instance data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckOut {
    pub book_id: BookId,
    pub member_id: MemberId,
    pub check_out_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,

    /// Why adding the book to the member's collection failed, if it did.
    pub collection_fault: Option<String>,
}

fn check_out_id(message: &LibraryMessage) -> Option<CorrelationId> {
    message.check_out_id().map(CorrelationId::from)
}

fn not_found(message: &LibraryMessage) -> LibraryMessage {
    // Only reached after by-id correlation, so the id is present.
    LibraryMessage::CheckOutNotFound(CheckOutNotFoundData {
        check_out_id: message.check_out_id().unwrap_or_default(),
    })
}

fn due_date(ctx: &BehaviorContext<'_, CheckOut, LibraryMessage>) -> CheckOutDueDateData {
    CheckOutDueDateData {
        check_out_id: CheckOutId::from(ctx.correlation_id()),
        due_date: ctx.data().due_date,
    }
}

/// Builds the CheckOut definition.
pub fn definition(
    settings: CheckOutSettings,
    registry: Arc<dyn MemberRegistry>,
) -> Result<SagaDefinition<CheckOut, LibraryMessage>, DefinitionError> {
    let renew_registry = Arc::clone(&registry);

    SagaDefinition::<CheckOut, LibraryMessage>::builder(SAGA_TYPE)
        .states(&[CHECKED_OUT])
        .event("BookCheckedOut", |e| e.by_id(check_out_id))
        .event("RenewCheckOut", |e| {
            e.by_id(check_out_id).respond_when_missing(not_found)
        })
        .event("AddBookToMemberCollectionFaulted", |e| e.by_id(check_out_id))
        .initially("BookCheckedOut", move |t| {
            t.then(move |ctx| {
                if let Some(LibraryMessage::BookCheckedOut(checked_out)) = ctx.message() {
                    let check_out = ctx.data_mut();
                    check_out.book_id = checked_out.book_id;
                    check_out.member_id = checked_out.member_id;
                    check_out.check_out_date = checked_out.timestamp;
                    check_out.due_date = checked_out.timestamp + settings.duration;
                }
            })
            .execute(NotifyMember::new(registry))
            .publish(|ctx| {
                LibraryMessage::AddBookToMemberCollection(MemberCollectionData {
                    check_out_id: CheckOutId::from(ctx.correlation_id()),
                    book_id: ctx.data().book_id,
                    member_id: ctx.data().member_id,
                })
            })
            .transition_to(CHECKED_OUT)
        })
        .during(&[CHECKED_OUT], "RenewCheckOut", move |t| {
            t.if_else(
                move |ctx| {
                    let limit = ctx.data().check_out_date + settings.limit;
                    ctx.now() + settings.duration > limit
                },
                move |limited| {
                    limited
                        .then(move |ctx| {
                            let check_out = ctx.data_mut();
                            check_out.due_date = check_out.check_out_date + settings.limit;
                        })
                        .respond(|ctx| LibraryMessage::CheckOutDurationLimitReached(due_date(ctx)))
                },
                move |renewed| {
                    renewed
                        .then(move |ctx| {
                            let now = ctx.now();
                            ctx.data_mut().due_date = now + settings.duration;
                        })
                        .execute(NotifyMember::new(renew_registry))
                        .respond(|ctx| LibraryMessage::CheckOutRenewed(due_date(ctx)))
                },
            )
        })
        .during(&[CHECKED_OUT], "AddBookToMemberCollectionFaulted", |t| {
            t.then(|ctx| {
                if let Some(LibraryMessage::AddBookToMemberCollectionFaulted(faulted)) =
                    ctx.message()
                {
                    tracing::warn!(
                        check_out_id = %faulted.check_out_id,
                        reason = %faulted.reason,
                        "book not added to member collection"
                    );
                    ctx.data_mut().collection_fault = Some(faulted.reason.clone());
                }
            })
        })
        .build()
}
