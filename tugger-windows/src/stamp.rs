// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Stamping icons, manifests and version resources into launchers. */

use {
    crate::{
        checksum::update_checksum,
        icon::IconGroup,
        resources::{ResourceData, ResourceId, ResourceTable, LANG_EN_US, RT_MANIFEST, RT_VERSION},
        version_info::VersionInfo,
    },
    anyhow::{anyhow, Context, Result},
    log::{debug, warn},
    std::{
        io::{BufRead, BufReader},
        path::{Path, PathBuf},
    },
};

/// Environment variable selecting the stamping implementation.
pub const STAMPER_ENV: &str = "PYFREEZE_VERSION_STAMPER";

/// Resource id of the manifest the loader reads for executables.
const CREATEPROCESS_MANIFEST_RESOURCE_ID: u16 = 1;

/// How resources get written into an image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StamperBackend {
    /// Rewrite the resource section ourselves.
    Native,
    /// Invoke `rcedit`.
    Rcedit,
}

impl StamperBackend {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "native" | "" => Ok(Self::Native),
            "rcedit" => Ok(Self::Rcedit),
            _ => Err(anyhow!(
                "{} is not a valid {}; use 'native' or 'rcedit'",
                name,
                STAMPER_ENV
            )),
        }
    }

    /// Resolve the backend from the environment.
    pub fn from_env() -> Result<Self> {
        match std::env::var(STAMPER_ENV) {
            Ok(value) => Self::from_name(&value),
            Err(_) => Ok(Self::Native),
        }
    }
}

/// Resources to write into a launcher.
#[derive(Clone, Debug, Default)]
pub struct ResourceStamp {
    pub icon: Option<PathBuf>,
    pub manifest: Option<String>,
    pub version: Option<VersionInfo>,
}

impl ResourceStamp {
    pub fn is_empty(&self) -> bool {
        self.icon.is_none() && self.manifest.is_none() && self.version.is_none()
    }
}

/// Apply a stamp to image data and recompute its checksum.
pub fn stamp_pe_data(image: &[u8], stamp: &ResourceStamp) -> Result<Vec<u8>> {
    let mut table = ResourceTable::from_pe(image).context("reading resources")?;

    if let Some(path) = &stamp.icon {
        let data = std::fs::read(path).with_context(|| format!("reading icon {}", path.display()))?;
        IconGroup::from_ico(&data)
            .with_context(|| format!("parsing icon {}", path.display()))?
            .install(&mut table, LANG_EN_US)?;
    }

    if let Some(manifest) = &stamp.manifest {
        table.remove_type(&ResourceId::Id(RT_MANIFEST));
        table.set(
            RT_MANIFEST,
            CREATEPROCESS_MANIFEST_RESOURCE_ID,
            LANG_EN_US,
            ResourceData::new(manifest.as_bytes().to_vec()),
        );
    }

    if let Some(version) = &stamp.version {
        table.remove_type(&ResourceId::Id(RT_VERSION));
        let mut data = ResourceData::new(version.to_bytes()?);
        data.code_page = 1252;
        table.set(RT_VERSION, 1u16, LANG_EN_US, data);
    }

    let mut data = table.apply_to_pe(image)?;
    update_checksum(&mut data)?;

    Ok(data)
}

/// Locate an `rcedit` executable.
pub fn find_rcedit() -> Result<PathBuf> {
    ["rcedit", "rcedit-x64", "rcedit-x86"]
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| anyhow!("unable to locate rcedit on PATH"))
}

fn run_rcedit(rcedit: &Path, args: Vec<String>) -> Result<()> {
    debug!("running {} {}", rcedit.display(), args.join(" "));

    let command = duct::cmd(rcedit, args)
        .stderr_to_stdout()
        .unchecked()
        .reader()
        .context("running rcedit")?;
    let mut first_line = None;
    {
        let reader = BufReader::new(&command);
        for line in reader.lines() {
            let line = line?;
            warn!("{}", line);
            first_line.get_or_insert(line);
        }
    }

    let output = command
        .try_wait()?
        .ok_or_else(|| anyhow!("unable to wait on command"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(anyhow!(
            "rcedit failed: {}",
            first_line.unwrap_or_else(|| "no output".to_string())
        ))
    }
}

/// Apply a stamp to a file, in place.
pub fn stamp_pe_file(path: &Path, stamp: &ResourceStamp, backend: StamperBackend) -> Result<()> {
    match backend {
        StamperBackend::Native => {
            let data = std::fs::read(path)?;
            let stamped = stamp_pe_data(&data, stamp)?;
            std::fs::write(path, stamped)?;
        }
        StamperBackend::Rcedit => {
            let rcedit = find_rcedit()?;
            let mut args = vec![path.display().to_string()];

            if let Some(version) = &stamp.version {
                args.push("--set-file-version".into());
                args.push(version.file_version.to_string());
                if let Some(product) = version.string("ProductVersion") {
                    args.push("--set-product-version".into());
                    args.push(product.to_string());
                }
                for (key, value) in &version.strings {
                    if key == "FileVersion" || key == "ProductVersion" {
                        continue;
                    }
                    args.push("--set-version-string".into());
                    args.push(key.clone());
                    args.push(value.clone());
                }
            }

            if let Some(icon) = &stamp.icon {
                args.push("--set-icon".into());
                args.push(icon.display().to_string());
            }

            // rcedit reads the manifest from a file.
            let manifest_file = match &stamp.manifest {
                Some(manifest) => {
                    let mut file = tempfile::Builder::new()
                        .prefix("pyfreeze-manifest")
                        .suffix(".manifest")
                        .tempfile()?;
                    std::io::Write::write_all(&mut file, manifest.as_bytes())?;
                    args.push("--application-manifest".into());
                    args.push(file.path().display().to_string());
                    Some(file)
                }
                None => None,
            };

            run_rcedit(&rcedit, args)?;
            drop(manifest_file);

            let mut data = std::fs::read(path)?;
            update_checksum(&mut data)?;
            std::fs::write(path, data)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            resources::{read_manifest, RT_GROUP_ICON},
            testutil::{sample_ico, PeBuilder},
        },
    };

    #[test]
    fn backend_names() -> Result<()> {
        assert_eq!(StamperBackend::from_name("native")?, StamperBackend::Native);
        assert_eq!(StamperBackend::from_name("rcedit")?, StamperBackend::Rcedit);
        assert!(StamperBackend::from_name("lief").is_err());

        Ok(())
    }

    #[test]
    fn native_stamp() -> Result<()> {
        let td = tempfile::Builder::new()
            .prefix("tugger-windows-test")
            .tempdir()?;
        let icon = td.path().join("app.ico");
        std::fs::write(&icon, sample_ico())?;

        let mut version = VersionInfo::new("0.1")?;
        version.set_string("CompanyName", "Example");

        let stamp = ResourceStamp {
            icon: Some(icon),
            manifest: Some("<assembly></assembly>".to_string()),
            version: Some(version),
        };
        assert!(!stamp.is_empty());

        let exe = td.path().join("hello.exe");
        std::fs::write(&exe, PeBuilder::new().import("python312.dll").build())?;
        stamp_pe_file(&exe, &stamp, StamperBackend::Native)?;

        let data = std::fs::read(&exe)?;
        assert_eq!(read_manifest(&data)?.as_deref(), Some("<assembly></assembly>"));

        let table = ResourceTable::from_pe(&data)?;
        let version = VersionInfo::from_bytes(
            &table
                .first_of_type(&ResourceId::Id(RT_VERSION))
                .ok_or_else(|| anyhow!("no version resource"))?
                .data,
        )?;
        assert_eq!(version.string("FileVersion"), Some("0.1.0.0"));
        assert_eq!(version.string("ProductVersion"), Some("0.1"));
        assert_eq!(version.file_version.to_string(), "0.1.0.0");
        assert!(table.first_of_type(&ResourceId::Id(RT_GROUP_ICON)).is_some());

        // Stamping twice yields the same bytes.
        stamp_pe_file(&exe, &stamp, StamperBackend::Native)?;
        assert_eq!(std::fs::read(&exe)?, data);

        Ok(())
    }
}
