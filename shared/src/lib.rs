//! Code shared between the launcher, the administrative CLI and the injected
//! shim: the overlay store, the `.reg` text codec, key-path canonicalization,
//! UTF-16LE payload helpers and the pure half of the merge engine.
//!
//! Everything in this crate is host-independent; the Windows-only pieces
//! (hooking, injection, console plumbing) live in the `shim-lib` and
//! `launcher` members.

pub mod args;
pub mod constants;
pub mod errors;
pub mod keypath;
pub mod merge;
pub mod regfile;
pub mod store;
pub mod wide;
