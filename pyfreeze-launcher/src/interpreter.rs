// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Running the embedded interpreter.

The interpreter is configured in isolated mode: environment variables and
the user site directory are ignored and `sys.path` is exactly the archive
followed by `lib`. The `__startup__` module then picks the entry point for
the running executable.
*/

use {
    crate::{error::LauncherError, layout::AppLayout},
    libc::{c_char, wchar_t},
    pyo3::ffi as pyffi,
    std::{
        ffi::{OsStr, OsString},
        mem::MaybeUninit,
        ptr::addr_of_mut,
    },
};

#[cfg(unix)]
use {std::ffi::CString, std::os::unix::ffi::OsStrExt};

#[cfg(windows)]
use std::os::windows::prelude::OsStrExt;

const STARTUP_MODULE: &[u8] = b"__startup__\0";
const STARTUP_FUNCTION: &[u8] = b"run\0";

fn check(status: pyffi::PyStatus, context: &str) -> Result<(), LauncherError> {
    if unsafe { pyffi::PyStatus_Exception(status) } != 0 {
        Err(LauncherError::from_status(&status, context))
    } else {
        Ok(())
    }
}

/// Call `f` with a NUL terminated wide string holding `value`.
#[cfg(unix)]
fn with_wide<T>(value: &OsStr, f: impl FnOnce(*const wchar_t) -> T) -> Result<T, LauncherError> {
    let encoding_error = || LauncherError::Encoding(value.to_string_lossy().to_string());

    let value = CString::new(value.as_bytes()).map_err(|_| encoding_error())?;
    let mut len: pyffi::Py_ssize_t = 0;
    let decoded = unsafe { pyffi::Py_DecodeLocale(value.as_ptr(), &mut len) };
    if decoded.is_null() {
        return Err(encoding_error());
    }

    let result = f(decoded);
    unsafe { pyffi::PyMem_RawFree(decoded as *mut _) };

    Ok(result)
}

#[cfg(windows)]
fn with_wide<T>(value: &OsStr, f: impl FnOnce(*const wchar_t) -> T) -> Result<T, LauncherError> {
    let mut wide: Vec<wchar_t> = value.encode_wide().collect();
    if wide.contains(&0) {
        return Err(LauncherError::Encoding(value.to_string_lossy().to_string()));
    }
    wide.push(0);

    Ok(f(wide.as_ptr()))
}

unsafe fn set_string(
    config: *mut pyffi::PyConfig,
    dest: *mut *mut wchar_t,
    value: &OsStr,
    context: &str,
) -> Result<(), LauncherError> {
    let status = with_wide(value, |w| pyffi::PyConfig_SetString(config, dest, w))?;
    check(status, context)
}

unsafe fn append(
    list: *mut pyffi::PyWideStringList,
    value: &OsStr,
    context: &str,
) -> Result<(), LauncherError> {
    let status = with_wide(value, |w| pyffi::PyWideStringList_Append(list, w))?;
    check(status, context)
}

unsafe fn configure(
    config: *mut pyffi::PyConfig,
    layout: &AppLayout,
    args: &[OsString],
) -> Result<(), LauncherError> {
    let executable = layout.executable.as_os_str();
    set_string(
        config,
        addr_of_mut!((*config).program_name),
        executable,
        "setting program_name",
    )?;
    set_string(
        config,
        addr_of_mut!((*config).executable),
        executable,
        "setting executable",
    )?;
    set_string(
        config,
        addr_of_mut!((*config).home),
        layout.app_dir.as_os_str(),
        "setting home",
    )?;

    for arg in args {
        append(addr_of_mut!((*config).argv), arg, "setting argv")?;
    }
    (*config).parse_argv = 0;

    for path in layout.module_search_paths() {
        append(
            addr_of_mut!((*config).module_search_paths),
            path.as_os_str(),
            "setting module_search_paths",
        )?;
    }
    (*config).module_search_paths_set = 1;

    (*config).site_import = 0;
    (*config).write_bytecode = 0;
    (*config).pathconfig_warnings = 0;

    Ok(())
}

/// Import `__startup__` and call its `run()`.
///
/// Uncaught exceptions are printed. `SystemExit` terminates the process
/// with its code from within `PyErr_Print()`.
unsafe fn run_startup() -> i32 {
    let module = pyffi::PyImport_ImportModule(STARTUP_MODULE.as_ptr() as *const c_char);
    if module.is_null() {
        pyffi::PyErr_Print();
        return 1;
    }

    let function = pyffi::PyObject_GetAttrString(module, STARTUP_FUNCTION.as_ptr() as *const c_char);
    pyffi::Py_DecRef(module);
    if function.is_null() {
        pyffi::PyErr_Print();
        return 1;
    }

    let result = pyffi::PyObject_CallObject(function, std::ptr::null_mut());
    pyffi::Py_DecRef(function);
    if result.is_null() {
        pyffi::PyErr_Print();
        return 1;
    }
    pyffi::Py_DecRef(result);

    0
}

/// Run a frozen application, returning the process exit code.
pub fn run(layout: &AppLayout, args: &[OsString]) -> Result<i32, LauncherError> {
    let mut config = MaybeUninit::<pyffi::PyConfig>::uninit();

    let initialized = unsafe {
        pyffi::PyConfig_InitIsolatedConfig(config.as_mut_ptr());

        let result = configure(config.as_mut_ptr(), layout, args).and_then(|()| {
            check(
                pyffi::Py_InitializeFromConfig(config.as_ptr()),
                "initializing Python",
            )
        });
        pyffi::PyConfig_Clear(config.as_mut_ptr());

        result
    };
    initialized?;

    let code = unsafe { run_startup() };

    // Errors flushing buffered data during finalization exit with 120, as
    // the python executable does.
    if unsafe { pyffi::Py_FinalizeEx() } < 0 && code == 0 {
        return Ok(120);
    }

    Ok(code)
}
