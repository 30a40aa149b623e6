//! Reservation workflow: holds a book for a member until it is checked out,
//! cancelled, or the hold expires.

use std::time::Duration;

use chrono::{DateTime, Utc};
use saga::prelude::*;
use saga::{DefinitionError, SagaDefinition};
use serde::{Deserialize, Serialize};

use crate::messages::{BookReservationCanceledData, LibraryMessage, ReservationExpiredData};
use crate::value_objects::{BookId, MemberId, ReservationId};

pub const SAGA_TYPE: &str = "Reservation";

pub const REQUESTED: &str = "Requested";
pub const RESERVED: &str = "Reserved";

/// Timer slot of the hold expiry.
pub const EXPIRATION_SLOT: &str = "Expiration";

/// Hold period used when the request does not name one.
pub const DEFAULT_HOLD: Duration = Duration::from_secs(24 * 60 * 60);

/// Reservation instance data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub book_id: BookId,
    pub member_id: MemberId,
    pub created: Option<DateTime<Utc>>,
    pub reserved: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
}

fn reservation_id(message: &LibraryMessage) -> Option<CorrelationId> {
    message.reservation_id().map(CorrelationId::from)
}

fn canceled(ctx: &BehaviorContext<'_, Reservation, LibraryMessage>) -> LibraryMessage {
    LibraryMessage::BookReservationCanceled(BookReservationCanceledData {
        book_id: ctx.data().book_id,
        reservation_id: ReservationId::from(ctx.correlation_id()),
    })
}

/// Builds the Reservation definition.
pub fn definition() -> Result<SagaDefinition<Reservation, LibraryMessage>, DefinitionError> {
    SagaDefinition::<Reservation, LibraryMessage>::builder(SAGA_TYPE)
        .states(&[REQUESTED, RESERVED])
        .event("ReservationRequested", |e| e.by_id(reservation_id))
        .event("BookReserved", |e| e.by_id(reservation_id))
        .event("ReservationExpired", |e| e.by_id(reservation_id))
        .event("ReservationCancellationRequested", |e| e.by_id(reservation_id))
        // The check-out names the book, not the reservation.
        .event("BookCheckedOut", |e| {
            e.by_predicate(|reservation: &Reservation, message: &LibraryMessage| {
                message.book_id() == Some(reservation.book_id)
            })
            .existing_only()
        })
        .initially("ReservationRequested", |t| {
            t.then(|ctx| {
                if let Some(LibraryMessage::ReservationRequested(requested)) = ctx.message() {
                    let reservation = ctx.data_mut();
                    reservation.created = Some(requested.timestamp);
                    reservation.book_id = requested.book_id;
                    reservation.member_id = requested.member_id;
                    reservation.duration = requested.duration;
                }
            })
            .transition_to(REQUESTED)
        })
        .during(&[REQUESTED], "BookReserved", |t| {
            t.then(|ctx| {
                if let Some(LibraryMessage::BookReserved(reserved)) = ctx.message() {
                    ctx.data_mut().reserved = Some(reserved.timestamp);
                }
            })
            .schedule(
                EXPIRATION_SLOT,
                |ctx| ctx.data().duration.unwrap_or(DEFAULT_HOLD),
                |ctx| {
                    LibraryMessage::ReservationExpired(ReservationExpiredData {
                        reservation_id: ReservationId::from(ctx.correlation_id()),
                    })
                },
            )
            .transition_to(RESERVED)
        })
        .during(&[RESERVED], "ReservationExpired", |t| {
            t.publish(canceled).finalize()
        })
        .during(
            &[REQUESTED, RESERVED],
            "ReservationCancellationRequested",
            |t| t.unschedule(EXPIRATION_SLOT).publish(canceled).finalize(),
        )
        .during(&[RESERVED], "BookCheckedOut", |t| {
            t.unschedule(EXPIRATION_SLOT).finalize()
        })
        .build()
}
