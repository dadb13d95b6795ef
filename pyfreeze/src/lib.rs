// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Freeze Python applications into standalone directories.

The [freezer::Freezer] discovers the modules an application imports,
stores their bytecode in a zip archive next to prebuilt launchers and
bundles every native library they need, relinked to load from the
application directory.
*/

pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod freezer;
pub mod launcher;
pub mod licensing;
pub mod logging;
pub mod startup;

#[cfg(test)]
mod testutil;
