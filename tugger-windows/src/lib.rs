// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Windows PE resource primitives.

This crate edits the resource section of PE images: version resources,
application manifests and icons. It also computes PE checksums. These are
the pieces needed to stamp a prebuilt launcher executable for a frozen
application.
*/

pub mod checksum;
pub use checksum::{compute_checksum, update_checksum};
pub mod icon;
pub use icon::{IconGroup, IconImage};
pub mod image;
pub use image::{is_pe_header, PeLayout, SectionHeader};
pub mod manifest;
pub use manifest::{application_manifest, set_execution_level, ExecutionLevel};
pub mod resources;
pub use resources::{read_manifest, ResourceData, ResourceId, ResourceTable};
pub mod stamp;
pub use stamp::{stamp_pe_data, stamp_pe_file, ResourceStamp, StamperBackend, STAMPER_ENV};
pub mod version_info;
pub use version_info::{normalize_version, NormalizedVersion, VersionInfo};

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
