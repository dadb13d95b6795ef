// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// No console window on Windows. Elsewhere this is the console launcher.
#![cfg_attr(windows, windows_subsystem = "windows")]

fn main() {
    std::process::exit(pyfreeze_launcher::run_current());
}
