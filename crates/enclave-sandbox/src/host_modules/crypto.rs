//! Hex digests over byte strings.

use mlua::{Lua, Table};
use sha2::{Digest, Sha256, Sha512};

pub(crate) fn create(lua: &Lua) -> mlua::Result<Table<'_>> {
    let module = lua.create_table()?;
    module.set(
        "sha256",
        lua.create_function(|_, data: mlua::String| Ok(sha256_hex(data.as_bytes())))?,
    )?;
    module.set(
        "sha512",
        lua.create_function(|_, data: mlua::String| Ok(sha512_hex(data.as_bytes())))?,
    )?;
    Ok(module)
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

pub(crate) fn sha512_hex(data: &[u8]) -> String {
    format!("{:x}", Sha512::digest(data))
}
