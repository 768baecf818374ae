//! Lexical path helpers. Nothing here touches the filesystem.

use std::path::{Component, Path, PathBuf};

use mlua::{Lua, Table, Variadic};

pub(crate) fn create(lua: &Lua) -> mlua::Result<Table<'_>> {
    let module = lua.create_table()?;
    module.set(
        "join",
        lua.create_function(|_, parts: Variadic<String>| Ok(join(&parts)))?,
    )?;
    module.set(
        "basename",
        lua.create_function(|_, path: String| Ok(basename(&path)))?,
    )?;
    module.set(
        "dirname",
        lua.create_function(|_, path: String| Ok(dirname(&path)))?,
    )?;
    module.set(
        "extname",
        lua.create_function(|_, path: String| Ok(extname(&path)))?,
    )?;
    module.set(
        "normalize",
        lua.create_function(|_, path: String| Ok(normalize(&path)))?,
    )?;
    module.set(
        "is_absolute",
        lua.create_function(|_, path: String| Ok(Path::new(&path).is_absolute()))?,
    )?;
    Ok(module)
}

pub(crate) fn join(parts: &[String]) -> String {
    let joined: PathBuf = parts.iter().collect();
    normalize(&joined.to_string_lossy())
}

pub(crate) fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub(crate) fn dirname(path: &str) -> String {
    match Path::new(path).parent() {
        Some(parent) if parent.as_os_str().is_empty() => String::from("."),
        Some(parent) => parent.to_string_lossy().into_owned(),
        None => String::from(path),
    }
}

pub(crate) fn extname(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

/// Collapses `.` and `..` components without consulting the filesystem.
///
/// `..` above a root is dropped; `..` at the start of a relative path is kept.
pub(crate) fn normalize(path: &str) -> String {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return String::from(".");
    }
    let normalised: PathBuf = parts.iter().collect();
    normalised.to_string_lossy().into_owned()
}
