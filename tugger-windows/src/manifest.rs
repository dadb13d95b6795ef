// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Application manifests. */

use {
    anyhow::{anyhow, Result},
    once_cell::sync::Lazy,
    regex::Regex,
    std::fmt::{Display, Formatter},
};

static REQUESTED_EXECUTION_LEVEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<requestedExecutionLevel\b[^>]*>(\s*</requestedExecutionLevel>)?")
        .expect("static regex should compile")
});

static ASSEMBLY_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</assembly>\s*$").expect("static regex should compile"));

/// Privilege level an application requests from UAC.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionLevel {
    AsInvoker,
    HighestAvailable,
    RequireAdministrator,
}

impl Display for ExecutionLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::AsInvoker => "asInvoker",
            Self::HighestAvailable => "highestAvailable",
            Self::RequireAdministrator => "requireAdministrator",
        })
    }
}

impl ExecutionLevel {
    /// The level selected by the UAC admin flag.
    pub fn from_uac_admin(uac_admin: bool) -> Self {
        if uac_admin {
            Self::RequireAdministrator
        } else {
            Self::AsInvoker
        }
    }
}

fn execution_level_element(level: ExecutionLevel, ui_access: bool) -> String {
    format!(
        "<requestedExecutionLevel level=\"{}\" uiAccess=\"{}\"/>",
        level, ui_access
    )
}

fn trust_info(level: ExecutionLevel, ui_access: bool) -> String {
    format!(
        r#"  <trustInfo xmlns="urn:schemas-microsoft-com:asm.v3">
    <security>
      <requestedPrivileges>
        {}
      </requestedPrivileges>
    </security>
  </trustInfo>
"#,
        execution_level_element(level, ui_access)
    )
}

/// Generate the default manifest for a launcher.
///
/// The manifest declares compatibility with Windows Vista through 11, opts
/// into long paths and requests the given execution level.
pub fn application_manifest(name: &str, level: ExecutionLevel, ui_access: bool) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
  <assemblyIdentity type="win32" name="{}" version="1.0.0.0" processorArchitecture="*"/>
{}  <compatibility xmlns="urn:schemas-microsoft-com:compatibility.v1">
    <application>
      <supportedOS Id="{{e2011457-1546-43c5-a5fe-008deee3d3f0}}"/>
      <supportedOS Id="{{35138b9a-5d96-4fbd-8e2d-a2440225f93a}}"/>
      <supportedOS Id="{{4a2f28e3-53b9-4441-ba9c-d69d4a4a6e38}}"/>
      <supportedOS Id="{{1f676c76-80e1-4239-95bb-83d0f6d0da78}}"/>
      <supportedOS Id="{{8e0f7a12-bfb3-4fe8-b9a5-48fd50a15a9a}}"/>
    </application>
  </compatibility>
  <application xmlns="urn:schemas-microsoft-com:asm.v3">
    <windowsSettings>
      <longPathAware xmlns="http://schemas.microsoft.com/SMI/2016/WindowsSettings">true</longPathAware>
    </windowsSettings>
  </application>
</assembly>
"#,
        xml_escape(name),
        trust_info(level, ui_access)
    )
}

/// Replace or inject the requested execution level of a manifest.
pub fn set_execution_level(manifest: &str, level: ExecutionLevel, ui_access: bool) -> Result<String> {
    let element = execution_level_element(level, ui_access);

    if REQUESTED_EXECUTION_LEVEL.is_match(manifest) {
        return Ok(REQUESTED_EXECUTION_LEVEL
            .replace(manifest, regex::NoExpand(&element))
            .to_string());
    }

    let end = ASSEMBLY_END
        .find(manifest)
        .ok_or_else(|| anyhow!("manifest has no closing </assembly> element"))?;

    Ok(format!(
        "{}{}{}",
        &manifest[0..end.start()],
        trust_info(level, ui_access),
        &manifest[end.start()..]
    ))
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
