// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Launcher base templates for frozen applications.

A launcher embeds the Python interpreter, points it at `lib/library.zip`
and `lib/` next to the executable and runs the `__startup__` module the
freezer generated. pyfreeze copies the built launchers into an
application directory and renames them after each executable.
*/

mod error;
pub use error::LauncherError;
pub mod interpreter;
pub mod layout;
pub use layout::AppLayout;

/// Run the frozen application the current process belongs to.
pub fn run_current() -> i32 {
    let args = std::env::args_os().collect::<Vec<_>>();

    match AppLayout::current().and_then(|layout| interpreter::run(&layout, &args)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal error: {}", e);
            1
        }
    }
}
