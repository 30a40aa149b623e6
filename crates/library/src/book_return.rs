//! Book return workflow: charges a fine when a book comes back late.

use std::time::Duration;

use chrono::{DateTime, Utc};
use saga::prelude::*;
use saga::{DefinitionError, SagaDefinition};
use serde::{Deserialize, Serialize};

use crate::messages::{FineData, LibraryMessage};
use crate::value_objects::{BookId, MemberId, Money};

pub const SAGA_TYPE: &str = "BookReturn";

pub const CHARGING_FINE: &str = "ChargingFine";
pub const COMPLETE: &str = "Complete";
pub const FAILED_TO_FINE_MEMBER: &str = "FailedToFineMember";

/// Request sent to the fine service.
pub const CHARGE_FINE: &str = "ChargeFine";

/// Queue of the fine service.
pub const FINE_SERVICE: &str = "charge-fine";

pub const FINE_TIMEOUT: Duration = Duration::from_secs(10);

/// Flat fine for a late return.
pub const LATE_FINE: Money = Money::from_cents(12345);

/// Book return instance data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookReturn {
    pub book_id: BookId,
    pub member_id: MemberId,
    pub check_out_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub return_date: DateTime<Utc>,

    /// Reason the fine could not be charged.
    pub fine_failure: Option<String>,
}

impl BookReturn {
    pub fn is_late(&self) -> bool {
        self.return_date > self.due_date
    }
}

fn check_out_id(message: &LibraryMessage) -> Option<CorrelationId> {
    message.check_out_id().map(CorrelationId::from)
}

/// Builds the BookReturn definition.
pub fn definition() -> Result<SagaDefinition<BookReturn, LibraryMessage>, DefinitionError> {
    SagaDefinition::<BookReturn, LibraryMessage>::builder(SAGA_TYPE)
        .states(&[CHARGING_FINE, COMPLETE, FAILED_TO_FINE_MEMBER])
        .request(RequestSpec::new(CHARGE_FINE, FINE_SERVICE, FINE_TIMEOUT))
        .event("BookReturned", |e| e.by_id(check_out_id))
        .initially("BookReturned", |t| {
            t.then(|ctx| {
                if let Some(LibraryMessage::BookReturned(returned)) = ctx.message() {
                    let book_return = ctx.data_mut();
                    book_return.book_id = returned.book_id;
                    book_return.member_id = returned.member_id;
                    book_return.check_out_date = returned.check_out_date;
                    book_return.due_date = returned.due_date;
                    book_return.return_date = returned.return_date;
                }
            })
            .if_else(
                |ctx| ctx.data().is_late(),
                |late| {
                    late.request(CHARGE_FINE, |ctx| {
                        LibraryMessage::ChargeMemberFine(FineData {
                            member_id: ctx.data().member_id,
                            amount: LATE_FINE,
                        })
                    })
                    .transition_to(CHARGING_FINE)
                },
                |on_time| on_time.transition_to(COMPLETE),
            )
        })
        .during(&[CHARGING_FINE], EventKey::Completed(CHARGE_FINE), |t| {
            t.transition_to(COMPLETE)
        })
        .during(&[CHARGING_FINE], EventKey::Faulted(CHARGE_FINE), |t| {
            t.then(|ctx| {
                let reason = ctx.fault().map(|fault| fault.reason.clone());
                ctx.data_mut().fine_failure = reason;
            })
            .transition_to(FAILED_TO_FINE_MEMBER)
        })
        .during(&[CHARGING_FINE], EventKey::TimeoutExpired(CHARGE_FINE), |t| {
            t.then(|ctx| ctx.data_mut().fine_failure = Some("fine service timed out".into()))
                .transition_to(FAILED_TO_FINE_MEMBER)
        })
        .build()
}
