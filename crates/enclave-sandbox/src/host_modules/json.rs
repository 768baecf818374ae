//! JSON encoding and decoding through `serde_json`.

use mlua::{Lua, LuaSerdeExt, Table, Value};

pub(crate) fn create(lua: &Lua) -> mlua::Result<Table<'_>> {
    let module = lua.create_table()?;
    module.set(
        "encode",
        lua.create_function(|lua, value: Value| {
            let json: serde_json::Value = lua.from_value(value)?;
            serde_json::to_string(&json).map_err(mlua::Error::external)
        })?,
    )?;
    module.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let json: serde_json::Value =
                serde_json::from_str(&text).map_err(mlua::Error::external)?;
            lua.to_value(&json)
        })?,
    )?;
    Ok(module)
}
