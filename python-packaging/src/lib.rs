// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Python packaging primitives for freezing applications.

This crate discovers the modules a Python application needs, understands the
bytecode and marshal formats of the CPython versions it supports, and writes
the bytecode archive a frozen application imports from.
*/

pub mod archive;
pub mod bytecode;
pub mod finder;
pub mod hooks;
pub mod import_scanner;
pub mod interpreter;
pub mod marshal;
pub mod module;
pub mod module_util;
pub mod opcode;
pub mod package_metadata;
pub mod path_resolver;
pub mod policy;
pub mod python_source;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
