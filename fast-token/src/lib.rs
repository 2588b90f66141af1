//! Packed field-token model for the FAST codec engine.
//!
//! A compiled template catalog is a flat array of 32-bit tokens. Each token
//! names a field type, the compression operator applied to it, whether the
//! field is optional, and the dictionary slot backing its state. The packed
//! form is what the hot decode/encode loops index on; [`Token`] is the
//! unpacked view used at API boundaries and by the catalog loader.

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]

mod tables;
mod tag;
mod token;

pub use tables::{pmap_bits, slot_width, FRAGMENT_HEADER_SLOTS, FRAGMENT_TRAILER_SLOTS};
pub use tag::{GroupFlags, InvalidToken, OpTag, TypeTag};
pub use token::{RawToken, Token};
