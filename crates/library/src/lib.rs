//! Library workflows built on the saga engine.
//!
//! This crate provides:
//! - The message contracts exchanged by catalog, circulation and fine services
//! - Book, Reservation, CheckOut, BookReturn and ThankYou saga definitions
//! - The member registry port used by check-outs

pub mod book;
pub mod book_return;
pub mod checkout;
pub mod error;
pub mod messages;
pub mod reservation;
pub mod thank_you;
pub mod value_objects;

pub use book::Book;
pub use book_return::BookReturn;
pub use checkout::{AnyMemberIsValid, CheckOut, CheckOutSettings, MemberRegistry, NotifyMember};
pub use error::LibraryError;
pub use messages::*;
pub use reservation::Reservation;
pub use thank_you::ThankYou;
pub use value_objects::{BookId, CheckOutId, MemberId, Money, ReservationId};
