// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

fn main() {
    pyo3_build_config::use_pyo3_cfgs();

    // Launchers load libpython from the lib directory next to them.
    match std::env::var("CARGO_CFG_TARGET_OS").as_deref() {
        Ok("macos") => {
            println!("cargo:rustc-link-arg-bins=-Wl,-rpath,@executable_path/lib");
        }
        Ok("windows") => {}
        _ => {
            println!("cargo:rustc-link-arg-bins=-Wl,-rpath,$ORIGIN/lib");
        }
    }
}
