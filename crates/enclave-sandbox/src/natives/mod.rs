//! Host replacements for standard library functions whose native loops never
//! return to the VM.
//!
//! The instruction hook only fires while Lua bytecode runs. A few C library
//! functions can loop without bound on tiny inputs: backtracking patterns,
//! `string.rep` of an empty string, and the element-shifting loops of
//! `table.move`, `table.insert`, and `table.remove` when `__len` reports a
//! huge length. Each is replaced by a host function that checks the same
//! deadline as the hook. `table.sort` refuses lengths the memory ceiling could
//! never hold, and `setmetatable` refuses `__gc`, since finalizers run with
//! hooks disabled. Everything else in the opened libraries is linear in input
//! the memory ceiling already bounds.

mod pattern;


use std::sync::{Arc, Mutex, PoisonError};

use mlua::{
    Function, Integer, Lua, MultiValue, RegistryKey, String as LuaString, Table, Value,
};

use crate::state::{DEADLINE_MESSAGE, IsolateState};

use self::pattern::{Captured, Matcher, PatternError, Ticker, find_literal, is_literal};

/// Bytes one array slot occupies in the Lua heap, as a shift.
const SLOT_SHIFT: u32 = 4;

/// Installs the replacements into whichever of `string` and `table` are
/// open. `memory_bytes` is the isolate's memory ceiling.
pub(crate) fn install(
    lua: &Lua,
    state: &Arc<IsolateState>,
    memory_bytes: usize,
) -> mlua::Result<()> {
    let globals = lua.globals();
    install_setmetatable(lua, &globals)?;
    if let Value::Table(string) = globals.raw_get::<_, Value>("string")? {
        install_string(lua, &string, state, memory_bytes)?;
    }
    if let Value::Table(table) = globals.raw_get::<_, Value>("table")? {
        install_table(lua, &table, state)?;
        install_sort(lua, &table, memory_bytes >> SLOT_SHIFT)?;
    }
    Ok(())
}

fn install_setmetatable(lua: &Lua, globals: &Table<'_>) -> mlua::Result<()> {
    let native = lua.create_registry_value(globals.raw_get::<_, Function>("setmetatable")?)?;
    globals.raw_set(
        "setmetatable",
        lua.create_function(move |lua, args: MultiValue| {
            let finalizer = match args.get(1) {
                Some(Value::Table(meta)) => meta.raw_get::<_, Value>("__gc")?,
                _ => Value::Nil,
            };
            if !finalizer.is_nil() {
                return Err(mlua::Error::runtime(
                    "'__gc' metamethods are not supported inside the sandbox",
                ));
            }
            let function: Function = lua.registry_value(&native)?;
            function.call::<_, MultiValue>(args)
        })?,
    )
}

/// Without a Lua comparator the stock sort never returns to the VM, so a
/// `__len` claiming billions of elements would stall it.
fn install_sort(lua: &Lua, table: &Table<'_>, max_elements: usize) -> mlua::Result<()> {
    let native = lua.create_registry_value(table.raw_get::<_, Function>("sort")?)?;
    let limit = to_integer(max_elements);
    table.raw_set(
        "sort",
        lua.create_function(move |lua, args: MultiValue| {
            let length = match args.get(0) {
                Some(Value::Table(target)) => target.len()?,
                _ => 0,
            };
            if length > limit {
                return Err(bad_argument(1, "sort", "array too big"));
            }
            let function: Function = lua.registry_value(&native)?;
            function.call::<_, MultiValue>(args)
        })?,
    )
}

fn install_string(
    lua: &Lua,
    string: &Table<'_>,
    state: &Arc<IsolateState>,
    memory_bytes: usize,
) -> mlua::Result<()> {
    let find_state = Arc::clone(state);
    string.raw_set(
        "find",
        lua.create_function(move |lua, args: SearchArgs| search(lua, &find_state, &args, true))?,
    )?;
    let match_state = Arc::clone(state);
    string.raw_set(
        "match",
        lua.create_function(move |lua, args: SearchArgs| search(lua, &match_state, &args, false))?,
    )?;
    let gmatch_state = Arc::clone(state);
    string.raw_set(
        "gmatch",
        lua.create_function(move |lua, (subject, pattern, init): (LuaString, LuaString, Option<Integer>)| {
            gmatch(lua, &gmatch_state, &subject, &pattern, init)
        })?,
    )?;
    let gsub_state = Arc::clone(state);
    string.raw_set(
        "gsub",
        lua.create_function(move |lua, args: SubstituteArgs| {
            substitute(lua, &gsub_state, memory_bytes, &args)
        })?,
    )?;
    let native_rep = lua.create_registry_value(string.raw_get::<_, Function>("rep")?)?;
    string.raw_set(
        "rep",
        lua.create_function(move |lua, args: MultiValue| repeat(lua, &native_rep, args))?,
    )
}

fn install_table(lua: &Lua, table: &Table<'_>, state: &Arc<IsolateState>) -> mlua::Result<()> {
    let move_state = Arc::clone(state);
    table.raw_set(
        "move",
        lua.create_function(move |_, args: MoveArgs| move_elements(&move_state, &args))?,
    )?;
    let insert_state = Arc::clone(state);
    table.raw_set(
        "insert",
        lua.create_function(move |lua, (target, rest): (Table, MultiValue)| {
            insert(lua, &insert_state, &target, rest)
        })?,
    )?;
    let remove_state = Arc::clone(state);
    table.raw_set(
        "remove",
        lua.create_function(move |lua, (target, position): (Table, Option<Value>)| {
            remove(lua, &remove_state, &target, position)
        })?,
    )
}

// ---------------------------------------------------------------------------
// Deadline plumbing
// ---------------------------------------------------------------------------

/// Polls the isolate deadline; a `true` result has already marked the
/// execution as timed out.
fn interrupt(state: &IsolateState) -> impl Fn() -> bool + '_ {
    move || state.check_deadline().is_err()
}

fn lua_error(error: PatternError) -> mlua::Error {
    match error {
        PatternError::Interrupted => mlua::Error::runtime(DEADLINE_MESSAGE),
        PatternError::Malformed(message) => mlua::Error::runtime(message),
    }
}

fn bad_argument(position: usize, function: &str, detail: &str) -> mlua::Error {
    mlua::Error::runtime(format!(
        "bad argument #{position} to '{function}' ({detail})"
    ))
}

fn is_truthy(value: &Value<'_>) -> bool {
    !matches!(value, Value::Nil | Value::Boolean(false))
}

fn to_integer(value: usize) -> Integer {
    Integer::try_from(value).unwrap_or(Integer::MAX)
}

/// Converts a one-based, possibly negative start position into a byte offset.
/// `None` means the start lies past the end of the subject.
fn start_offset(init: Option<Integer>, length: usize) -> Option<usize> {
    let len = to_integer(length);
    let position = match init.unwrap_or(1) {
        position if position > 0 => position,
        position if position == 0 || position < -len => 1,
        position => len + position + 1,
    };
    usize::try_from(position - 1)
        .ok()
        .filter(|offset| *offset <= length)
}

fn capture_values<'lua>(
    lua: &'lua Lua,
    captures: Vec<Captured<'_>>,
) -> mlua::Result<MultiValue<'lua>> {
    captures
        .into_iter()
        .map(|captured| capture_value(lua, captured))
        .collect::<mlua::Result<Vec<_>>>()
        .map(MultiValue::from_vec)
}

fn capture_value<'lua>(lua: &'lua Lua, captured: Captured<'_>) -> mlua::Result<Value<'lua>> {
    match captured {
        Captured::Text(text) => lua.create_string(text).map(Value::String),
        Captured::Position(position) => Ok(Value::Integer(to_integer(position))),
    }
}

// ---------------------------------------------------------------------------
// string.find / string.match
// ---------------------------------------------------------------------------

type SearchArgs<'lua> = (
    LuaString<'lua>,
    LuaString<'lua>,
    Option<Integer>,
    Option<Value<'lua>>,
);

fn search<'lua>(
    lua: &'lua Lua,
    state: &IsolateState,
    (subject, pattern, init, plain): &SearchArgs<'lua>,
    positions: bool,
) -> mlua::Result<MultiValue<'lua>> {
    let source = subject.as_bytes();
    let needle = pattern.as_bytes();
    let Some(start) = start_offset(*init, source.len()) else {
        return Ok(MultiValue::from_vec(vec![Value::Nil]));
    };
    let interrupted = interrupt(state);
    let mut ticker = Ticker::new(&interrupted);

    if positions && (plain.as_ref().is_some_and(is_truthy) || is_literal(needle)) {
        let found = find_literal(source, needle, start, &mut ticker).map_err(lua_error)?;
        return Ok(MultiValue::from_vec(found.map_or_else(
            || vec![Value::Nil],
            |offset| {
                vec![
                    Value::Integer(to_integer(offset + 1)),
                    Value::Integer(to_integer(offset + needle.len())),
                ]
            },
        )));
    }

    let anchored = needle.first() == Some(&b'^');
    let pattern_start = usize::from(anchored);
    let mut matcher = Matcher::new(source, needle, ticker);
    let mut cursor = start;
    loop {
        if let Some(end) = matcher.attempt(cursor, pattern_start).map_err(lua_error)? {
            if !positions {
                let captures = matcher.captures(Some((cursor, end))).map_err(lua_error)?;
                return capture_values(lua, captures);
            }
            let captures = matcher.captures(None).map_err(lua_error)?;
            let mut values = vec![
                Value::Integer(to_integer(cursor + 1)),
                Value::Integer(to_integer(end)),
            ];
            values.extend(capture_values(lua, captures)?);
            return Ok(MultiValue::from_vec(values));
        }
        cursor += 1;
        if anchored || cursor > source.len() {
            return Ok(MultiValue::from_vec(vec![Value::Nil]));
        }
    }
}

// ---------------------------------------------------------------------------
// string.gmatch
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct GmatchCursor {
    next: Option<usize>,
    last_match: Option<usize>,
}

fn gmatch<'lua>(
    lua: &'lua Lua,
    state: &Arc<IsolateState>,
    subject: &LuaString<'lua>,
    pattern: &LuaString<'lua>,
    init: Option<Integer>,
) -> mlua::Result<Function<'lua>> {
    let source = subject.as_bytes().to_vec();
    let needle = pattern.as_bytes().to_vec();
    let cursor = Mutex::new(GmatchCursor {
        next: start_offset(init, source.len()),
        last_match: None,
    });
    let iterator_state = Arc::clone(state);
    lua.create_function(move |lua, ()| {
        let mut position = cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut start) = position.next else {
            return Ok(MultiValue::new());
        };
        let interrupted = interrupt(&iterator_state);
        let mut matcher = Matcher::new(&source, &needle, Ticker::new(&interrupted));
        while start <= source.len() {
            let found = matcher.attempt(start, 0).map_err(lua_error)?;
            if let Some(end) = found.filter(|end| Some(*end) != position.last_match) {
                position.next = Some(end);
                position.last_match = Some(end);
                let captures = matcher.captures(Some((start, end))).map_err(lua_error)?;
                return capture_values(lua, captures);
            }
            start += 1;
        }
        position.next = None;
        Ok(MultiValue::new())
    })
}

// ---------------------------------------------------------------------------
// string.gsub
// ---------------------------------------------------------------------------

type SubstituteArgs<'lua> = (LuaString<'lua>, LuaString<'lua>, Value<'lua>, Option<Integer>);

/// Result buffer for `gsub`. It lives outside the Lua heap, so it is held to
/// the memory ceiling explicitly.
struct Output {
    bytes: Vec<u8>,
    limit: usize,
}

impl Output {
    fn extend(&mut self, chunk: &[u8]) -> mlua::Result<()> {
        if self.bytes.len().saturating_add(chunk.len()) > self.limit {
            return Err(mlua::Error::MemoryError("not enough memory".to_owned()));
        }
        self.bytes.extend_from_slice(chunk);
        Ok(())
    }

    fn extend_captured(&mut self, captured: Captured<'_>) -> mlua::Result<()> {
        match captured {
            Captured::Text(text) => self.extend(text),
            Captured::Position(position) => self.extend(position.to_string().as_bytes()),
        }
    }
}

fn substitute<'lua>(
    lua: &'lua Lua,
    state: &IsolateState,
    max_output: usize,
    (subject, pattern, replacement, max): &SubstituteArgs<'lua>,
) -> mlua::Result<(LuaString<'lua>, Integer)> {
    if !matches!(
        replacement,
        Value::String(_) | Value::Integer(_) | Value::Number(_) | Value::Table(_) | Value::Function(_)
    ) {
        return Err(bad_argument(
            3,
            "gsub",
            &format!(
                "string/function/table expected, got {}",
                replacement.type_name()
            ),
        ));
    }
    let source = subject.as_bytes();
    let needle = pattern.as_bytes();
    let anchored = needle.first() == Some(&b'^');
    let pattern_start = usize::from(anchored);
    let limit = max.unwrap_or_else(|| to_integer(source.len() + 1));

    let interrupted = interrupt(state);
    let mut matcher = Matcher::new(source, needle, Ticker::new(&interrupted));
    let mut output = Output {
        bytes: Vec::with_capacity(source.len().min(max_output)),
        limit: max_output,
    };
    let mut cursor = 0_usize;
    let mut last_match = None;
    let mut count: Integer = 0;
    while count < limit {
        let found = matcher.attempt(cursor, pattern_start).map_err(lua_error)?;
        if let Some(end) = found.filter(|end| Some(*end) != last_match) {
            count += 1;
            append_replacement(lua, &matcher, (cursor, end), replacement, &mut output)?;
            cursor = end;
            last_match = Some(end);
        } else if let Some(byte) = source.get(cursor) {
            output.extend(&[*byte])?;
            cursor += 1;
        } else {
            break;
        }
        if anchored {
            break;
        }
    }
    output.extend(source.get(cursor..).unwrap_or_default())?;
    Ok((lua.create_string(output.bytes)?, count))
}

fn append_replacement<'lua>(
    lua: &'lua Lua,
    matcher: &Matcher<'_, '_>,
    (start, end): (usize, usize),
    replacement: &Value<'lua>,
    output: &mut Output,
) -> mlua::Result<()> {
    let chosen: Value<'lua> = match replacement {
        Value::Table(lookup) => {
            let key = matcher.capture(0, start, end).map_err(lua_error)?;
            lookup.get(capture_value(lua, key)?)?
        }
        Value::Function(callback) => {
            let captures = matcher.captures(Some((start, end))).map_err(lua_error)?;
            callback.call(capture_values(lua, captures)?)?
        }
        template => {
            let text = lua
                .coerce_string(template.clone())?
                .ok_or_else(|| bad_argument(3, "gsub", "string expected"))?;
            return expand_template(text.as_bytes(), matcher, (start, end), output);
        }
    };
    match chosen {
        Value::Nil | Value::Boolean(false) => output.extend(matcher.text(start, end)),
        value @ (Value::String(_) | Value::Integer(_) | Value::Number(_)) => lua
            .coerce_string(value)?
            .map_or(Ok(()), |text| output.extend(text.as_bytes())),
        other => Err(mlua::Error::runtime(format!(
            "invalid replacement value (a {})",
            other.type_name()
        ))),
    }
}

/// Expands `%0`-`%9` and `%%` in a replacement string.
fn expand_template(
    template: &[u8],
    matcher: &Matcher<'_, '_>,
    (start, end): (usize, usize),
    output: &mut Output,
) -> mlua::Result<()> {
    let mut bytes = template.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            output.extend(&[byte])?;
            continue;
        }
        match bytes.next() {
            Some(b'%') => output.extend(b"%")?,
            Some(b'0') => output.extend(matcher.text(start, end))?,
            Some(digit @ b'1'..=b'9') => {
                let index = usize::from(digit - b'1');
                output.extend_captured(matcher.capture(index, start, end).map_err(lua_error)?)?;
            }
            _ => {
                return Err(mlua::Error::runtime(
                    "invalid use of '%' in replacement string",
                ));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// string.rep
// ---------------------------------------------------------------------------

/// Repeating an empty string with an empty separator is answered directly;
/// the native loop would spin `n` times without allocating.
fn repeat<'lua>(
    lua: &'lua Lua,
    native: &RegistryKey,
    args: MultiValue<'lua>,
) -> mlua::Result<MultiValue<'lua>> {
    let separator = args.get(2);
    let empty_separator =
        matches!(separator, None | Some(Value::Nil)) || is_empty_string(separator);
    let numeric_count = matches!(args.get(1), Some(Value::Integer(_) | Value::Number(_)));
    if is_empty_string(args.get(0)) && empty_separator && numeric_count {
        return Ok(MultiValue::from_vec(vec![Value::String(
            lua.create_string("")?,
        )]));
    }
    let function: Function = lua.registry_value(native)?;
    function.call(args)
}

fn is_empty_string(value: Option<&Value<'_>>) -> bool {
    matches!(value, Some(Value::String(text)) if text.as_bytes().is_empty())
}

// ---------------------------------------------------------------------------
// table.move / table.insert / table.remove
// ---------------------------------------------------------------------------

type MoveArgs<'lua> = (Table<'lua>, Integer, Integer, Integer, Option<Table<'lua>>);

fn move_elements<'lua>(
    state: &IsolateState,
    (source, first, last, target, destination): &MoveArgs<'lua>,
) -> mlua::Result<Table<'lua>> {
    let (first, last, target) = (*first, *last, *target);
    let distinct = destination.as_ref().is_some_and(|table| table != source);
    let sink = destination.clone().unwrap_or_else(|| source.clone());
    if last < first {
        return Ok(sink);
    }
    if first <= 0 && last >= Integer::MAX + first {
        return Err(bad_argument(3, "move", "too many elements to move"));
    }
    let span = last - first;
    if target > Integer::MAX - span {
        return Err(bad_argument(4, "move", "destination wrap around"));
    }
    let interrupted = interrupt(state);
    let mut ticker = Ticker::new(&interrupted);
    let mut copy = |offset: Integer| -> mlua::Result<()> {
        ticker.step(1).map_err(lua_error)?;
        sink.set(target + offset, source.get::<_, Value>(first + offset)?)
    };
    if target > last || target <= first || distinct {
        (0..=span).try_for_each(&mut copy)?;
    } else {
        (0..=span).rev().try_for_each(&mut copy)?;
    }
    Ok(sink)
}

fn integer_argument(
    lua: &Lua,
    value: Value<'_>,
    position: usize,
    function: &str,
) -> mlua::Result<Integer> {
    let type_name = value.type_name();
    lua.coerce_integer(value)?.ok_or_else(|| {
        bad_argument(
            position,
            function,
            &format!("number expected, got {type_name}"),
        )
    })
}

/// Moves `table[from]` to `table[from + 1]` down to `table[to + 1]`, highest
/// first.
fn shift_up(
    state: &IsolateState,
    table: &Table<'_>,
    from: Integer,
    to: Integer,
) -> mlua::Result<()> {
    let interrupted = interrupt(state);
    let mut ticker = Ticker::new(&interrupted);
    let mut index = from;
    while index > to {
        ticker.step(1).map_err(lua_error)?;
        table.set(index, table.get::<_, Value>(index - 1)?)?;
        index -= 1;
    }
    Ok(())
}

fn insert<'lua>(
    lua: &'lua Lua,
    state: &IsolateState,
    table: &Table<'lua>,
    rest: MultiValue<'lua>,
) -> mlua::Result<()> {
    let first_empty = table.len()?.saturating_add(1);
    let mut values = rest.into_iter();
    match (values.next(), values.next(), values.next()) {
        (Some(value), None, None) => table.set(first_empty, value),
        (Some(requested), Some(value), None) => {
            let position = integer_argument(lua, requested, 2, "insert")?;
            if position < 1 || position > first_empty {
                return Err(bad_argument(2, "insert", "position out of bounds"));
            }
            shift_up(state, table, first_empty, position)?;
            table.set(position, value)
        }
        _ => Err(mlua::Error::runtime("wrong number of arguments to 'insert'")),
    }
}

fn remove<'lua>(
    lua: &'lua Lua,
    state: &IsolateState,
    table: &Table<'lua>,
    position: Option<Value<'lua>>,
) -> mlua::Result<Value<'lua>> {
    let size = table.len()?;
    let index = match position {
        None | Some(Value::Nil) => size,
        Some(value) => integer_argument(lua, value, 2, "remove")?,
    };
    if index != size && (index < 1 || index > size.saturating_add(1)) {
        return Err(bad_argument(2, "remove", "position out of bounds"));
    }
    let removed: Value = table.get(index)?;
    let interrupted = interrupt(state);
    let mut ticker = Ticker::new(&interrupted);
    let mut cursor = index;
    while cursor < size {
        ticker.step(1).map_err(lua_error)?;
        table.set(cursor, table.get::<_, Value>(cursor + 1)?)?;
        cursor += 1;
    }
    table.set(cursor, Value::Nil)?;
    Ok(removed)
}
