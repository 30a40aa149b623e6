//! Thank-you workflow: once a member has both reserved and checked out the
//! same book, they are ready to be thanked.
//!
//! Instances are keyed by (book, member) rather than by an id carried in
//! the messages, so every event correlates by predicate.

use saga::prelude::*;
use saga::{DefinitionError, SagaDefinition};
use serde::{Deserialize, Serialize};

use crate::messages::{LibraryMessage, ThankYouStatusData};
use crate::value_objects::{BookId, MemberId, ReservationId};

pub const SAGA_TYPE: &str = "ThankYou";

pub const ACTIVE: &str = "Active";
pub const READY: &str = "Ready";

/// Composite raised once both the reservation and the check-out were seen.
pub const READY_TO_THANK: &str = "ReadyToThank";

/// Status reported for a member with no thank-you.
pub const NOT_FOUND: &str = "Not Found";

/// Thank-you instance data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThankYou {
    pub book_id: BookId,
    pub member_id: MemberId,
    pub reservation_id: Option<ReservationId>,
}

impl ThankYou {
    /// Natural key of the instance.
    pub fn key(&self) -> String {
        format!("{}:{}", self.book_id, self.member_id)
    }
}

fn same_book_and_member(thank_you: &ThankYou, message: &LibraryMessage) -> bool {
    message.book_id() == Some(thank_you.book_id) && message.member_id() == Some(thank_you.member_id)
}

fn copy_ids(ctx: &mut BehaviorContext<'_, ThankYou, LibraryMessage>) {
    let Some(message) = ctx.message() else {
        return;
    };
    let thank_you = ctx.data_mut();
    if let Some(book_id) = message.book_id() {
        thank_you.book_id = book_id;
    }
    if let Some(member_id) = message.member_id() {
        thank_you.member_id = member_id;
    }
}

fn copy_reservation(ctx: &mut BehaviorContext<'_, ThankYou, LibraryMessage>) {
    let reservation_id = ctx.message().and_then(LibraryMessage::reservation_id);
    ctx.data_mut().reservation_id = reservation_id;
}

fn not_found(message: &LibraryMessage) -> LibraryMessage {
    LibraryMessage::ThankYouStatus(ThankYouStatusData {
        member_id: message.member_id().unwrap_or_default(),
        book_id: None,
        status: NOT_FOUND.to_string(),
    })
}

/// Builds the ThankYou definition.
pub fn definition() -> Result<SagaDefinition<ThankYou, LibraryMessage>, DefinitionError> {
    SagaDefinition::<ThankYou, LibraryMessage>::builder(SAGA_TYPE)
        .states(&[ACTIVE, READY])
        .unique_key(|thank_you| Some(thank_you.key()))
        .event("BookReserved", |e| {
            e.by_predicate(same_book_and_member).new_id(NewId::MessageId)
        })
        .event("BookCheckedOut", |e| {
            e.by_predicate(same_book_and_member).new_id(NewId::MessageId)
        })
        .event("GetThankYouStatus", |e| {
            e.by_predicate(|thank_you: &ThankYou, message: &LibraryMessage| {
                message.member_id() == Some(thank_you.member_id)
            })
            .read_only()
            .respond_when_missing(not_found)
        })
        .composite(
            CompositeSpec::new(READY_TO_THANK, ["BookReserved", "BookCheckedOut"])
                .include_initial(),
        )
        .initially("BookReserved", |t| {
            t.then(copy_ids).then(copy_reservation).transition_to(ACTIVE)
        })
        .initially("BookCheckedOut", |t| t.then(copy_ids).transition_to(ACTIVE))
        .during(&[ACTIVE], "BookReserved", |t| t.then(copy_reservation))
        .ignore(&[ACTIVE], "BookCheckedOut")
        .during_any("GetThankYouStatus", |t| {
            t.respond(|ctx| {
                LibraryMessage::ThankYouStatus(ThankYouStatusData {
                    member_id: ctx.data().member_id,
                    book_id: Some(ctx.data().book_id),
                    status: ctx.state().to_string(),
                })
            })
        })
        .during_any(EventKey::Composite(READY_TO_THANK), |t| t.transition_to(READY))
        .build()
}
