// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: memoryd entrypoint wiring default transport to the pager server

fn main() {
    if let Err(err) = memoryd::daemon_main() {
        eprintln!("memoryd: exited with error: {err}");
        std::process::exit(1);
    }
}
