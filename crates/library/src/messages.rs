//! Message contracts exchanged by the library workflows.

use std::time::Duration;

use chrono::{DateTime, Utc};
use saga::SagaMessage;
use serde::{Deserialize, Serialize};

use crate::value_objects::{BookId, CheckOutId, MemberId, Money, ReservationId};

/// Every message the library workflows publish, send, or consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LibraryMessage {
    /// A book was added to the catalog.
    BookAdded(BookAddedData),

    /// A member asked to reserve a book.
    ReservationRequested(ReservationRequestedData),

    /// The book accepted a reservation.
    BookReserved(BookReservedData),

    /// A reservation no longer holds the book.
    BookReservationCanceled(BookReservationCanceledData),

    /// A member withdrew a reservation.
    ReservationCancellationRequested(ReservationCancellationRequestedData),

    /// A reservation's hold period elapsed.
    ReservationExpired(ReservationExpiredData),

    /// A member checked a book out.
    BookCheckedOut(BookCheckedOutData),

    /// A member returned a book.
    BookReturned(BookReturnedData),

    /// A member asked to extend a check-out.
    RenewCheckOut(RenewCheckOutData),

    /// The check-out was extended.
    CheckOutRenewed(CheckOutDueDateData),

    /// The check-out cannot be extended past its limit.
    CheckOutDurationLimitReached(CheckOutDueDateData),

    /// No check-out matched a renewal.
    CheckOutNotFound(CheckOutNotFoundData),

    /// Tell a member when a book is due.
    NotifyMemberDueDate(NotifyMemberDueDateData),

    /// Add a checked-out book to the member's collection.
    AddBookToMemberCollection(MemberCollectionData),

    /// Adding a book to the member's collection failed.
    AddBookToMemberCollectionFaulted(MemberCollectionFaultedData),

    /// Charge a member a late fine.
    ChargeMemberFine(FineData),

    /// The fine was charged.
    FineCharged(FineData),

    /// Query a member's thank-you progress.
    GetThankYouStatus(GetThankYouStatusData),

    /// Answer to [`LibraryMessage::GetThankYouStatus`].
    ThankYouStatus(ThankYouStatusData),
}

impl SagaMessage for LibraryMessage {
    fn message_type(&self) -> &'static str {
        match self {
            LibraryMessage::BookAdded(_) => "BookAdded",
            LibraryMessage::ReservationRequested(_) => "ReservationRequested",
            LibraryMessage::BookReserved(_) => "BookReserved",
            LibraryMessage::BookReservationCanceled(_) => "BookReservationCanceled",
            LibraryMessage::ReservationCancellationRequested(_) => {
                "ReservationCancellationRequested"
            }
            LibraryMessage::ReservationExpired(_) => "ReservationExpired",
            LibraryMessage::BookCheckedOut(_) => "BookCheckedOut",
            LibraryMessage::BookReturned(_) => "BookReturned",
            LibraryMessage::RenewCheckOut(_) => "RenewCheckOut",
            LibraryMessage::CheckOutRenewed(_) => "CheckOutRenewed",
            LibraryMessage::CheckOutDurationLimitReached(_) => "CheckOutDurationLimitReached",
            LibraryMessage::CheckOutNotFound(_) => "CheckOutNotFound",
            LibraryMessage::NotifyMemberDueDate(_) => "NotifyMemberDueDate",
            LibraryMessage::AddBookToMemberCollection(_) => "AddBookToMemberCollection",
            LibraryMessage::AddBookToMemberCollectionFaulted(_) => {
                "AddBookToMemberCollectionFaulted"
            }
            LibraryMessage::ChargeMemberFine(_) => "ChargeMemberFine",
            LibraryMessage::FineCharged(_) => "FineCharged",
            LibraryMessage::GetThankYouStatus(_) => "GetThankYouStatus",
            LibraryMessage::ThankYouStatus(_) => "ThankYouStatus",
        }
    }
}

impl LibraryMessage {
    /// The book the message is about, if it names one.
    pub fn book_id(&self) -> Option<BookId> {
        match self {
            LibraryMessage::BookAdded(d) => Some(d.book_id),
            LibraryMessage::ReservationRequested(d) => Some(d.book_id),
            LibraryMessage::BookReserved(d) => Some(d.book_id),
            LibraryMessage::BookReservationCanceled(d) => Some(d.book_id),
            LibraryMessage::BookCheckedOut(d) => Some(d.book_id),
            LibraryMessage::BookReturned(d) => Some(d.book_id),
            LibraryMessage::AddBookToMemberCollection(d) => Some(d.book_id),
            LibraryMessage::AddBookToMemberCollectionFaulted(d) => Some(d.book_id),
            LibraryMessage::ThankYouStatus(d) => d.book_id,
            _ => None,
        }
    }

    /// The member the message is about, if it names one.
    pub fn member_id(&self) -> Option<MemberId> {
        match self {
            LibraryMessage::ReservationRequested(d) => Some(d.member_id),
            LibraryMessage::BookReserved(d) => Some(d.member_id),
            LibraryMessage::BookCheckedOut(d) => Some(d.member_id),
            LibraryMessage::BookReturned(d) => Some(d.member_id),
            LibraryMessage::NotifyMemberDueDate(d) => Some(d.member_id),
            LibraryMessage::AddBookToMemberCollection(d) => Some(d.member_id),
            LibraryMessage::AddBookToMemberCollectionFaulted(d) => Some(d.member_id),
            LibraryMessage::ChargeMemberFine(d) | LibraryMessage::FineCharged(d) => {
                Some(d.member_id)
            }
            LibraryMessage::GetThankYouStatus(d) => Some(d.member_id),
            LibraryMessage::ThankYouStatus(d) => Some(d.member_id),
            _ => None,
        }
    }

    /// The reservation the message is about, if it names one.
    pub fn reservation_id(&self) -> Option<ReservationId> {
        match self {
            LibraryMessage::ReservationRequested(d) => Some(d.reservation_id),
            LibraryMessage::BookReserved(d) => Some(d.reservation_id),
            LibraryMessage::BookReservationCanceled(d) => Some(d.reservation_id),
            LibraryMessage::ReservationCancellationRequested(d) => Some(d.reservation_id),
            LibraryMessage::ReservationExpired(d) => Some(d.reservation_id),
            _ => None,
        }
    }

    /// The check-out the message is about, if it names one.
    pub fn check_out_id(&self) -> Option<CheckOutId> {
        match self {
            LibraryMessage::BookCheckedOut(d) => Some(d.check_out_id),
            LibraryMessage::BookReturned(d) => Some(d.check_out_id),
            LibraryMessage::RenewCheckOut(d) => Some(d.check_out_id),
            LibraryMessage::CheckOutRenewed(d)
            | LibraryMessage::CheckOutDurationLimitReached(d) => Some(d.check_out_id),
            LibraryMessage::CheckOutNotFound(d) => Some(d.check_out_id),
            LibraryMessage::AddBookToMemberCollection(d) => Some(d.check_out_id),
            LibraryMessage::AddBookToMemberCollectionFaulted(d) => Some(d.check_out_id),
            _ => None,
        }
    }
}

/// Data for BookAdded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookAddedData {
    pub book_id: BookId,
    pub timestamp: DateTime<Utc>,
    pub isbn: String,
    pub title: String,
}

/// Data for ReservationRequested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRequestedData {
    pub reservation_id: ReservationId,
    pub timestamp: DateTime<Utc>,

    /// How long the book is held; the reservation's default applies if unset.
    pub duration: Option<Duration>,

    pub member_id: MemberId,
    pub book_id: BookId,
}

/// Data for BookReserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookReservedData {
    pub reservation_id: ReservationId,
    pub timestamp: DateTime<Utc>,
    pub member_id: MemberId,
    pub book_id: BookId,
}

/// Data for BookReservationCanceled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookReservationCanceledData {
    pub book_id: BookId,
    pub reservation_id: ReservationId,
}

/// Data for ReservationCancellationRequested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationCancellationRequestedData {
    pub reservation_id: ReservationId,
    pub timestamp: DateTime<Utc>,
}

/// Data for ReservationExpired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationExpiredData {
    pub reservation_id: ReservationId,
}

/// Data for BookCheckedOut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookCheckedOutData {
    pub check_out_id: CheckOutId,
    pub timestamp: DateTime<Utc>,
    pub member_id: MemberId,
    pub book_id: BookId,
}

/// Data for BookReturned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookReturnedData {
    pub check_out_id: CheckOutId,
    pub timestamp: DateTime<Utc>,
    pub member_id: MemberId,
    pub book_id: BookId,
    pub check_out_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub return_date: DateTime<Utc>,
}

/// Data for RenewCheckOut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewCheckOutData {
    pub check_out_id: CheckOutId,
}

/// Data for CheckOutRenewed and CheckOutDurationLimitReached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutDueDateData {
    pub check_out_id: CheckOutId,
    pub due_date: DateTime<Utc>,
}

/// Data for CheckOutNotFound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutNotFoundData {
    pub check_out_id: CheckOutId,
}

/// Data for NotifyMemberDueDate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyMemberDueDateData {
    pub member_id: MemberId,
    pub due_date: DateTime<Utc>,
}

/// Data for AddBookToMemberCollection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberCollectionData {
    pub check_out_id: CheckOutId,
    pub book_id: BookId,
    pub member_id: MemberId,
}

/// Data for AddBookToMemberCollectionFaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberCollectionFaultedData {
    pub check_out_id: CheckOutId,
    pub book_id: BookId,
    pub member_id: MemberId,
    pub reason: String,
}

/// Data for ChargeMemberFine and FineCharged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineData {
    pub member_id: MemberId,
    pub amount: Money,
}

/// Data for GetThankYouStatus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetThankYouStatusData {
    pub member_id: MemberId,
}

/// Data for ThankYouStatus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThankYouStatusData {
    pub member_id: MemberId,

    /// Unset when no thank-you exists for the member.
    pub book_id: Option<BookId>,

    /// Current state name, or `Not Found`.
    pub status: String,
}
