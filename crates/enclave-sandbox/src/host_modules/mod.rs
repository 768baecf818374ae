//! Host modules scripts may `require`.
//!
//! Every module here is a pure function library: no filesystem, network, or
//! process access, and no state shared between isolates.

mod crypto;
mod json;
pub(crate) mod path;


use mlua::{Lua, Table};

use crate::profile::HostModule;

/// Builds a fresh table for the requested host module.
pub(crate) fn create(lua: &Lua, module: HostModule) -> mlua::Result<Table<'_>> {
    match module {
        HostModule::Path => path::create(lua),
        HostModule::Crypto => crypto::create(lua),
        HostModule::Json => json::create(lua),
    }
}
