// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Licensing functionality.

use {
    crate::error::FreezeError,
    log::info,
    std::path::{Path, PathBuf},
};

/// Name of the licence file written next to launchers.
pub const LICENSE_FILE_NAME: &str = "frozen_application_license.txt";

const LICENSE_HEADER: &str = "\
Portions of this application are based on pyfreeze. The launcher executables
and the startup modules they run are covered by the license below.
Redistributions of this application must retain this notice.

";

const LAUNCHER_LICENSE: &str = "\
pyfreeze is subject to the terms of the Mozilla Public License, v. 2.0.
A copy of the license is available at https://mozilla.org/MPL/2.0/.

Covered Software is provided under this License on an \"as is\" basis,
without warranty of any kind, either expressed, implied, or statutory,
including, without limitation, warranties that the Covered Software is free
of defects, merchantable, fit for a particular purpose or non-infringing.
";

/// Text of the licence file.
///
/// `license_path` replaces the bundled licence text.
pub fn license_text(license_path: Option<&Path>) -> Result<String, FreezeError> {
    let body = match license_path {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| FreezeError::file(path, format!("unable to read license: {}", e)))?,
        None => LAUNCHER_LICENSE.to_string(),
    };

    Ok(format!("{}{}", LICENSE_HEADER, body))
}

/// Write the licence file into a target directory.
pub fn write_license_file(
    target_dir: &Path,
    license_path: Option<&Path>,
) -> Result<PathBuf, FreezeError> {
    let path = target_dir.join(LICENSE_FILE_NAME);
    info!("writing {}", path.display());
    std::fs::write(&path, license_text(license_path)?)?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use {super::*, anyhow::Result};

    #[test]
    fn bundled_and_custom_text() -> Result<()> {
        let td = tempfile::Builder::new().prefix("pyfreeze-test").tempdir()?;

        let path = write_license_file(td.path(), None)?;
        let text = std::fs::read_to_string(&path)?;
        assert!(text.starts_with("Portions of this application"));
        assert!(text.contains("Mozilla Public License"));

        let custom = td.path().join("LICENSE.txt");
        std::fs::write(&custom, "custom terms\n")?;
        let text = license_text(Some(&custom))?;
        assert!(text.ends_with("custom terms\n"));

        let err = license_text(Some(&td.path().join("missing.txt"))).unwrap_err();
        assert!(matches!(err, FreezeError::File(..)));

        Ok(())
    }
}
