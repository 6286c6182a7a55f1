// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generates `kconfig.rs` from the build environment.
//!
//! The kernel takes a single shape fixed at compile time. Rather than
//! hand-editing constants in the source, an application build sets the
//! `ALACRITY_*` environment variables below; anything left unset falls back
//! to a default that suits the test suite.

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

/// (constant name, environment variable, Rust type, default)
const KNOBS: [(&str, &str, &str, u64); 6] = [
    ("TASK_COUNT", "ALACRITY_TASKS", "usize", 8),
    ("PRIORITY_COUNT", "ALACRITY_PRIORITIES", "usize", 4),
    ("READY_DEPTH", "ALACRITY_READY_DEPTH", "usize", 8),
    ("SEM_COUNT", "ALACRITY_SEMS", "usize", 4),
    ("MUTEX_COUNT", "ALACRITY_MUTEXES", "usize", 4),
    ("TICK_PERIOD_US", "ALACRITY_TICK_US", "u32", 1000),
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out = PathBuf::from(env::var_os("OUT_DIR").unwrap());

    let mut text = String::new();
    writeln!(text, "// Generated by build.rs -- do not edit.")?;
    for (name, var, ty, default) in KNOBS {
        println!("cargo:rerun-if-env-changed={var}");
        let value = match env::var(var) {
            Ok(v) => v
                .parse::<u64>()
                .unwrap_or_else(|_| panic!("{var} must be an integer, got {v:?}")),
            Err(_) => default,
        };
        writeln!(text, "pub const {name}: {ty} = {value};")?;
    }

    fs::write(out.join("kconfig.rs"), text)?;
    Ok(())
}
