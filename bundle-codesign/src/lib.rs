// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code signing of nested application bundles on macOS.
//!
//! This crate signs a macOS application bundle and everything inside it
//! (frameworks, plugins, helper tools, loose libraries) using Apple's
//! `codesign` tool, in an order that keeps every nested signature valid.
//!
//! `codesign` seals the signatures of nested code objects into the signature
//! of whatever contains them. Re-signing an inner object after its container
//! breaks the container. So the bundle is signed bottom-up: components are
//! grouped into categories ([ComponentCategory]) that are signed one pass at
//! a time, deepest paths first, and the bundle root is signed last.
//!
//! # Usage
//!
//! Build a [CodesignConfig], then hand it to [codesign_bundle] along with an
//! [IdentityLister] (normally [SecurityIdentityLister]), a [CommandRunner]
//! (normally [DuctCommandRunner]) and a [LogContext]. For finer control,
//! validate the configuration yourself and drive a [Codesigner] stage by
//! stage.
//!
//! Nothing here talks to the keychain or implements signing itself: all of
//! that is delegated to `codesign`, `security` and `xattr`, which means this
//! crate only does useful work on macOS. The orchestration logic is platform
//! independent and tested with a recording [CommandRunner].

pub mod bundle;
mod codesign;
pub use codesign::*;
mod component;
pub use component::*;
mod config;
pub use config::*;
pub mod entitlements;
mod error;
pub use error::*;
mod identity;
pub use identity::*;
mod logging;
pub use logging::*;
pub mod plist_codec;
mod process;
pub use process::*;
mod signer;
pub use signer::*;

#[cfg(test)]
mod testutil;
