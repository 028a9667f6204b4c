//! Embedded Lua 5.4 backend.
//!
//! Source is evaluated as an expression when it parses as one and as a
//! statement block otherwise, so `2+2` yields a number while `x = 1` yields
//! `Undefined`. Precompiled bytecode is refused.

use super::ScriptBackend;
use crate::command::Source;
use crate::config::ConnectionConfig;
use crate::error::EngineError;
use crate::value::{decode_latin1, TaggedValue};
use mlua::{ChunkMode, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Value, Variadic};

/// Lua interpreter owned by one worker.
pub struct LuaBackend {
    lua: Option<Lua>,
    memory_limit: Option<usize>,
    instruction_limit: Option<u32>,
}

impl LuaBackend {
    pub fn new() -> Self {
        Self {
            lua: None,
            memory_limit: None,
            instruction_limit: None,
        }
    }

    /// Backend honoring the engine limits in `config`.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            lua: None,
            memory_limit: config.memory_limit,
            instruction_limit: config.instruction_limit,
        }
    }
}

impl Default for LuaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptBackend for LuaBackend {
    fn name(&self) -> &'static str {
        "lua54"
    }

    fn open(&mut self) -> Result<(), EngineError> {
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::new())
            .map_err(|e| EngineError::ContextOpenFailed(e.to_string()))?;
        if let Some(limit) = self.memory_limit {
            lua.set_memory_limit(limit)
                .map_err(|e| EngineError::ContextOpenFailed(e.to_string()))?;
        }
        install_print(&lua).map_err(|e| EngineError::ContextOpenFailed(e.to_string()))?;
        tracing::trace!(
            memory_limit = ?self.memory_limit,
            instruction_limit = ?self.instruction_limit,
            "Lua context created"
        );
        self.lua = Some(lua);
        Ok(())
    }

    fn close(&mut self) {
        if self.lua.take().is_some() {
            tracing::trace!("Lua context destroyed");
        }
    }

    fn eval(&mut self, source: &Source) -> Result<TaggedValue, TaggedValue> {
        let Some(lua) = self.lua.as_ref() else {
            return Err(TaggedValue::String("no Lua context".into()));
        };

        let chunk = lua
            .load(source.as_bytes())
            .set_name("=eval")
            .set_mode(ChunkMode::Text);

        if let Some(limit) = self.instruction_limit {
            lua.set_hook(
                HookTriggers::new().every_nth_instruction(limit),
                move |_lua, _debug| {
                    Err(mlua::Error::RuntimeError(format!(
                        "instruction limit exceeded ({limit})"
                    )))
                },
            );
        }

        let result = chunk.eval::<MultiValue>();

        if self.instruction_limit.is_some() {
            lua.remove_hook();
        }

        match result {
            Ok(values) => Ok(values
                .into_iter()
                .next()
                .map_or(TaggedValue::Undefined, |v| classify(&v))),
            Err(e) => Err(TaggedValue::String(format_error(&e))),
        }
    }
}

/// Map a Lua value onto the engine-neutral classification.
fn classify(value: &Value) -> TaggedValue {
    match value {
        Value::Nil => TaggedValue::Null,
        Value::Boolean(b) => TaggedValue::Bool(*b),
        Value::Integer(i) => TaggedValue::Number(*i as f64),
        Value::Number(n) => TaggedValue::Number(*n),
        Value::String(s) => TaggedValue::from_latin1(&s.as_bytes()),
        Value::Table(_) | Value::Thread(_) => TaggedValue::Object,
        Value::UserData(_) => TaggedValue::Buffer,
        Value::LightUserData(_) => TaggedValue::Pointer,
        Value::Function(_) => TaggedValue::LightFunc,
        _ => TaggedValue::Unknown,
    }
}

fn format_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(msg) => msg.clone(),
        mlua::Error::CallbackError { cause, .. } => format_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("compile error: {message}"),
        mlua::Error::MemoryError(msg) => format!("memory error: {msg}"),
        _ => err.to_string(),
    }
}

/// `print(...)`: arguments joined with a space, emitted as a diagnostic event.
fn install_print(lua: &Lua) -> mlua::Result<()> {
    let print = lua.create_function(|_, args: Variadic<Value>| {
        let line = args.iter().map(render).collect::<Vec<_>>().join(" ");
        tracing::info!(target: "spindle::script", "{line}");
        Ok(())
    })?;
    lua.globals().set("print", print)
}

fn render(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => decode_latin1(&s.as_bytes()),
        other => format!("{}: {:p}", other.type_name(), other.to_pointer()),
    }
}
