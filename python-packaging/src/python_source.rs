// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Utility functions related to Python source code. */

use {
    anyhow::{anyhow, Result},
    once_cell::sync::Lazy,
};

static RE_CODING: Lazy<regex::bytes::Regex> = Lazy::new(|| {
    regex::bytes::Regex::new(r"^[ \t\f]*#.*?coding[:=][ \t]*([-_.a-zA-Z0-9]+)").expect("static regex should compile")
});

/// Derive the source encoding from Python source code.
pub fn python_source_encoding(source: &[u8]) -> Vec<u8> {
    // Default source encoding is UTF-8. But per PEP 263, the first or second
    // line of source can match a regular expression to define a custom
    // encoding.
    let lines = source.split(|v| v == &b'\n');

    for (i, line) in lines.enumerate() {
        if i > 1 {
            break;
        }

        if let Some(caps) = RE_CODING.captures(line) {
            if let Some(m) = caps.get(1) {
                return m.as_bytes().to_vec();
            }
        }
    }

    b"utf-8".to_vec()
}

/// Decode Python source into a string honoring its declared encoding.
pub fn decode_source(source: &[u8]) -> String {
    let encoding = python_source_encoding(source);

    let encoder = match encoding_rs::Encoding::for_label(&encoding) {
        Some(encoder) => encoder,
        None => encoding_rs::UTF_8,
    };

    let (source, ..) = encoder.decode(source);

    source.to_string()
}

/// Apply literal find/replace patches to Python source.
///
/// Every patch must match at least once. The result is UTF-8; a coding
/// declaration naming another encoding is rewritten accordingly.
pub fn patch_source(source: &[u8], patches: &[(String, String)]) -> Result<Vec<u8>> {
    if patches.is_empty() {
        return Ok(source.to_vec());
    }

    let mut text = decode_source(source);

    for (find, replace) in patches {
        if !text.contains(find.as_str()) {
            return Err(anyhow!("source does not contain {:?}", find));
        }
        text = text.replace(find.as_str(), replace);
    }

    let encoding = python_source_encoding(source);
    if !encoding.eq_ignore_ascii_case(b"utf-8") && !encoding.eq_ignore_ascii_case(b"utf8") {
        let declared = String::from_utf8_lossy(&encoding).to_string();
        let mut lines = text.splitn(3, '\n').map(|s| s.to_string()).collect::<Vec<_>>();
        for line in lines.iter_mut().take(2) {
            if RE_CODING.is_match(line.as_bytes()) {
                *line = line.replacen(&declared, "utf-8", 1);
                break;
            }
        }
        text = lines.join("\n");
    }

    Ok(text.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_declaration() {
        assert_eq!(python_source_encoding(b"import os\n"), b"utf-8");
        assert_eq!(
            python_source_encoding(b"#!/usr/bin/python\n# -*- coding: latin-1 -*-\n"),
            b"latin-1"
        );
        assert_eq!(
            python_source_encoding(b"\n\n# coding: latin-1\n"),
            b"utf-8"
        );
    }

    #[test]
    fn patching() -> Result<()> {
        let patched = patch_source(
            b"import sys\nsys.path.insert(0, HERE)\n",
            &[("sys.path.insert(0, HERE)".to_string(), "pass".to_string())],
        )?;
        assert_eq!(patched, b"import sys\npass\n");

        assert!(patch_source(b"x = 1\n", &[("y".to_string(), "z".to_string())]).is_err());

        let latin = b"# coding: latin-1\nname = '\xe9'\n";
        let patched = patch_source(latin, &[("name".to_string(), "value".to_string())])?;
        assert_eq!(
            String::from_utf8(patched)?,
            "# coding: utf-8\nvalue = '\u{e9}'\n"
        );

        Ok(())
    }
}
