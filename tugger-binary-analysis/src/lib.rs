// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Finding, bundling and relinking the shared library dependencies of binaries.

A [BinaryWalker] discovers the libraries launchers and extension modules
load, consulting a [CopyPolicy] to decide which get bundled. The resulting
[BinaryTracker] is laid out with [assign_targets], copied with
[copy_binaries] and finally relinked by a [BinaryRewriter] so every bundled
binary loads its bundled dependencies. Format specifics live behind the
[OsBackend] trait.
*/

pub mod backend;
pub use backend::{
    backend_for, host_backend, DefaultList, ElfBackend, ElfDependencies, InterpreterPaths,
    LoadContext, MachOBackend, OsBackend, PeBackend, PlannedReference, RewritePlan,
};
mod binary;
pub use binary::{
    reference_basename, strip_library_version, BinaryFile, BinaryFormat, BinaryKind, ParsedBinary,
    Reference,
};
pub mod elf;
mod error;
pub use error::BinaryError;
mod layout;
pub use layout::{assign_targets, copy_binaries, hashed_name, Collision, LayoutOptions, LayoutReport};
pub mod macho;
pub mod pe;
mod policy;
pub use policy::{CopyPolicy, CopyRule};
mod rewriter;
pub use rewriter::{bottom_up_order, plan_for, BinaryRewriter};
mod tools;
pub use tools::{find_tool, run_tool};
mod tracker;
pub use tracker::BinaryTracker;
pub mod util;
mod walker;
pub use walker::{BinaryWalker, WalkerOptions};

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
