//! Book workflow: one instance per catalog entry.
//!
//! ```text
//! Initial --BookAdded--> Available --ReservationRequested--> Reserved
//!                        Available|Reserved --BookCheckedOut--> CheckedOut
//!                        Reserved --BookReservationCanceled--> Available
//!                        CheckedOut --BookReturned--> Available
//! ```

use chrono::NaiveDate;
use saga::prelude::*;
use saga::{DefinitionError, SagaDefinition};
use serde::{Deserialize, Serialize};

use crate::messages::{BookReservedData, LibraryMessage};
use crate::value_objects::{MemberId, ReservationId};

pub const SAGA_TYPE: &str = "Book";

pub const AVAILABLE: &str = "Available";
pub const RESERVED: &str = "Reserved";
pub const CHECKED_OUT: &str = "CheckedOut";

/// Book instance data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub title: String,
    pub isbn: String,
    pub date_added: Option<NaiveDate>,

    /// Reservation currently holding the book.
    pub reservation_id: Option<ReservationId>,

    /// Member the book is held for or checked out to.
    pub member_id: Option<MemberId>,
}

fn book_id(message: &LibraryMessage) -> Option<CorrelationId> {
    message.book_id().map(CorrelationId::from)
}

fn copy_book_added(ctx: &mut BehaviorContext<'_, Book, LibraryMessage>) {
    if let Some(LibraryMessage::BookAdded(added)) = ctx.message() {
        let book = ctx.data_mut();
        book.date_added = Some(added.timestamp.date_naive());
        book.title = added.title.clone();
        book.isbn = added.isbn.clone();
    }
}

/// Builds the Book definition.
pub fn definition() -> Result<SagaDefinition<Book, LibraryMessage>, DefinitionError> {
    SagaDefinition::<Book, LibraryMessage>::builder(SAGA_TYPE)
        .states(&[AVAILABLE, RESERVED, CHECKED_OUT])
        .event("BookAdded", |e| e.by_id(book_id))
        .event("ReservationRequested", |e| e.by_id(book_id).existing_only())
        .event("BookReservationCanceled", |e| e.by_id(book_id))
        .event("BookCheckedOut", |e| e.by_id(book_id))
        .event("BookReturned", |e| e.by_id(book_id))
        .initially("BookAdded", |t| {
            t.then(copy_book_added).transition_to(AVAILABLE)
        })
        .during_any("BookAdded", |t| t.then(copy_book_added))
        .during(&[AVAILABLE], "ReservationRequested", |t| {
            t.then(|ctx| {
                let Some(LibraryMessage::ReservationRequested(requested)) = ctx.message() else {
                    return;
                };
                let book = ctx.data_mut();
                book.reservation_id = Some(requested.reservation_id);
                book.member_id = Some(requested.member_id);

                let now = ctx.now();
                ctx.publish(LibraryMessage::BookReserved(BookReservedData {
                    reservation_id: requested.reservation_id,
                    timestamp: now,
                    member_id: requested.member_id,
                    book_id: requested.book_id,
                }));
            })
            .transition_to(RESERVED)
        })
        .ignore(&[RESERVED], "ReservationRequested")
        .during(&[RESERVED], "BookReservationCanceled", |t| {
            t.guard(|ctx| {
                let canceled = ctx.message().and_then(LibraryMessage::reservation_id);
                canceled.is_some() && canceled == ctx.data().reservation_id
            })
            .then(|ctx| {
                let book = ctx.data_mut();
                book.reservation_id = None;
                book.member_id = None;
            })
            .transition_to(AVAILABLE)
        })
        .during(&[AVAILABLE, RESERVED], "BookCheckedOut", |t| {
            t.then(|ctx| {
                let member_id = ctx.message().and_then(LibraryMessage::member_id);
                let book = ctx.data_mut();
                book.reservation_id = None;
                book.member_id = member_id;
            })
            .transition_to(CHECKED_OUT)
        })
        .during(&[CHECKED_OUT], "BookReturned", |t| {
            t.then(|ctx| ctx.data_mut().member_id = None)
                .transition_to(AVAILABLE)
        })
        .build()
}
