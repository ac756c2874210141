//! Structured clone for values crossing a worker boundary.
//!
//! A value is copied out of the sending engine into a [`StructuredValue`]
//! and rebuilt as fresh objects inside the receiving engine, so the two
//! sides never share a live object.

use boa_engine::{
    Context, JsObject, JsResult, JsString, JsValue, js_string,
    object::builtins::{JsArray, JsDate, JsMap, JsPromise, JsRegExp, JsSet},
    property::PropertyKey,
};
use serde::Serialize;

use super::bridge::WorkerBinding;
use super::error::{WorkerError, WorkerResult};

/// Maximum nesting accepted by the codec
pub const MAX_DEPTH: usize = 1000;

/// Engine-independent copy of a cloneable value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StructuredValue {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Array(Vec<StructuredValue>),
    /// Own string-keyed properties in insertion order
    Object(Vec<(String, StructuredValue)>),
    /// Time value in milliseconds since the epoch
    Date(f64),
    RegExp { source: String, flags: String },
    /// Entries in insertion order
    Map(Vec<(StructuredValue, StructuredValue)>),
    Set(Vec<StructuredValue>),
}

impl StructuredValue {
    /// Copy a value out of the engine.
    ///
    /// Plain objects, arrays, `Date`, `RegExp`, `Map` and `Set` are copied.
    /// Anything else fails with [`WorkerError::UncloneableValue`]: functions,
    /// symbols, BigInts, promises, worker handles, cyclic structures and
    /// other exotic or built-in objects.
    pub fn from_js(value: &JsValue, context: &mut Context) -> WorkerResult<Self> {
        let mut ancestors = Vec::new();
        Self::clone_value(value, &mut ancestors, context)
    }

    fn clone_value(
        value: &JsValue,
        ancestors: &mut Vec<JsObject>,
        context: &mut Context,
    ) -> WorkerResult<Self> {
        if value.is_undefined() {
            return Ok(Self::Undefined);
        }
        if value.is_null() {
            return Ok(Self::Null);
        }
        if let Some(b) = value.as_boolean() {
            return Ok(Self::Boolean(b));
        }
        if let Some(n) = value.as_number() {
            return Ok(Self::Number(n));
        }
        if let Some(s) = value.as_string() {
            return Ok(Self::String(s.to_std_string_escaped()));
        }
        if value.is_symbol() {
            return Err(uncloneable("Symbol values could not be cloned"));
        }
        if value.is_bigint() {
            return Err(uncloneable("BigInt values could not be cloned"));
        }

        let Some(obj) = value.as_object() else {
            return Err(uncloneable("value could not be cloned"));
        };

        if obj.is_callable() {
            return Err(uncloneable("function could not be cloned"));
        }
        if obj.downcast_ref::<WorkerBinding>().is_some() {
            return Err(uncloneable("Worker object could not be cloned"));
        }
        if JsPromise::from_object(obj.clone()).is_ok() {
            return Err(uncloneable("Promise object could not be cloned"));
        }
        if ancestors.iter().any(|seen| JsObject::equals(seen, &obj)) {
            return Err(uncloneable("cyclic structures could not be cloned"));
        }
        if ancestors.len() >= MAX_DEPTH {
            return Err(uncloneable("maximum clone depth exceeded"));
        }

        if let Ok(date) = JsDate::from_object(obj.clone()) {
            let time = date.get_time(context).map_err(|e| uncloneable(e.to_string()))?;
            return Ok(Self::Date(time.as_number().unwrap_or(f64::NAN)));
        }
        if let Ok(regexp) = JsRegExp::from_object(obj.clone()) {
            let source = regexp.source(context).map_err(|e| uncloneable(e.to_string()))?;
            let flags = regexp.flags(context).map_err(|e| uncloneable(e.to_string()))?;
            return Ok(Self::RegExp { source, flags });
        }

        ancestors.push(obj.clone());
        let cloned = if obj.is_array() {
            Self::clone_array(&obj, ancestors, context)
        } else if let Ok(map) = JsMap::from_object(obj.clone()) {
            Self::clone_map(&map, ancestors, context)
        } else if let Ok(set) = JsSet::from_object(obj.clone()) {
            Self::clone_set(&set, ancestors, context)
        } else if obj.is_ordinary() {
            Self::clone_object(&obj, ancestors, context)
        } else {
            Err(uncloneable(format!("{} object could not be cloned", tag_of(&obj, context))))
        };
        ancestors.pop();
        cloned
    }

    fn clone_array(
        obj: &JsObject,
        ancestors: &mut Vec<JsObject>,
        context: &mut Context,
    ) -> WorkerResult<Self> {
        let array = JsArray::from_object(obj.clone()).map_err(|e| uncloneable(e.to_string()))?;
        let len = array.length(context).map_err(|e| uncloneable(e.to_string()))?;
        let mut items = Vec::with_capacity(len as usize);
        for i in 0..len {
            let item = array.get(i, context).map_err(|e| uncloneable(e.to_string()))?;
            items.push(Self::clone_value(&item, ancestors, context)?);
        }
        Ok(Self::Array(items))
    }

    fn clone_map(
        map: &JsMap,
        ancestors: &mut Vec<JsObject>,
        context: &mut Context,
    ) -> WorkerResult<Self> {
        let entries = map.entries(context).map_err(|e| uncloneable(e.to_string()))?;
        let mut pairs = Vec::new();
        while let Some(entry) = next_value(|ctx| entries.next(ctx), context)? {
            let Some(entry) = entry.as_object() else {
                return Err(uncloneable("malformed Map entry"));
            };
            let key = entry.get(0u32, context).map_err(|e| uncloneable(e.to_string()))?;
            let value = entry.get(1u32, context).map_err(|e| uncloneable(e.to_string()))?;
            pairs.push((
                Self::clone_value(&key, ancestors, context)?,
                Self::clone_value(&value, ancestors, context)?,
            ));
        }
        Ok(Self::Map(pairs))
    }

    fn clone_set(
        set: &JsSet,
        ancestors: &mut Vec<JsObject>,
        context: &mut Context,
    ) -> WorkerResult<Self> {
        let values = set.values(context).map_err(|e| uncloneable(e.to_string()))?;
        let mut items = Vec::new();
        while let Some(value) = next_value(|ctx| values.next(ctx), context)? {
            items.push(Self::clone_value(&value, ancestors, context)?);
        }
        Ok(Self::Set(items))
    }

    fn clone_object(
        obj: &JsObject,
        ancestors: &mut Vec<JsObject>,
        context: &mut Context,
    ) -> WorkerResult<Self> {
        let keys = obj
            .own_property_keys(context)
            .map_err(|e| uncloneable(e.to_string()))?;

        let mut props = Vec::with_capacity(keys.len());
        for key in keys {
            let name = match &key {
                PropertyKey::String(s) => s.to_std_string_escaped(),
                PropertyKey::Symbol(_) => continue,
                PropertyKey::Index(i) => i.get().to_string(),
            };
            let value = obj.get(key, context).map_err(|e| uncloneable(e.to_string()))?;
            props.push((name, Self::clone_value(&value, ancestors, context)?));
        }
        Ok(Self::Object(props))
    }

    /// Rebuild the value as fresh engine objects.
    pub fn to_js(&self, context: &mut Context) -> JsResult<JsValue> {
        Ok(match self {
            Self::Undefined => JsValue::undefined(),
            Self::Null => JsValue::null(),
            Self::Boolean(b) => JsValue::from(*b),
            Self::Number(n) => JsValue::from(*n),
            Self::String(s) => JsValue::from(JsString::from(s.as_str())),
            Self::Array(items) => {
                let array = JsArray::new(context);
                for item in items {
                    let value = item.to_js(context)?;
                    array.push(value, context)?;
                }
                array.into()
            }
            Self::Object(props) => {
                let obj = JsObject::with_object_proto(context.intrinsics());
                for (key, value) in props {
                    let value = value.to_js(context)?;
                    obj.set(JsString::from(key.as_str()), value, true, context)?;
                }
                obj.into()
            }
            Self::Date(time) => {
                let date = JsDate::new(context);
                date.set_time(*time, context)?;
                date.into()
            }
            Self::RegExp { source, flags } => JsRegExp::new(
                JsValue::from(JsString::from(source.as_str())),
                JsValue::from(JsString::from(flags.as_str())),
                context,
            )?
            .into(),
            Self::Map(pairs) => {
                let map = JsMap::new(context);
                for (key, value) in pairs {
                    let key = key.to_js(context)?;
                    let value = value.to_js(context)?;
                    map.set(key, value, context)?;
                }
                map.into()
            }
            Self::Set(items) => {
                let set = JsSet::new(context);
                for item in items {
                    let value = item.to_js(context)?;
                    set.add(value, context)?;
                }
                set.into()
            }
        })
    }

    /// Clone any serializable Rust value.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> WorkerResult<Self> {
        serde_json::to_value(value)
            .map(Self::from)
            .map_err(|e| uncloneable(e.to_string()))
    }

    /// JSON view of the value; `undefined` and non-finite numbers become `null`.
    ///
    /// Dates become their time value, regular expressions their `/source/flags`
    /// text, sets an array and maps an array of `[key, value]` pairs.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;

        match self {
            Self::Undefined | Self::Null => Value::Null,
            Self::Boolean(b) => Value::Bool(*b),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Self::String(s) => Value::String(s.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Object(props) => Value::Object(
                props
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::Date(time) => Self::Number(*time).to_json(),
            Self::RegExp { source, flags } => Value::String(format!("/{source}/{flags}")),
            Self::Map(pairs) => Value::Array(
                pairs
                    .iter()
                    .map(|(k, v)| Value::Array(vec![k.to_json(), v.to_json()]))
                    .collect(),
            ),
            Self::Set(items) => Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[StructuredValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Property lookup on an `Object` value
    pub fn get(&self, key: &str) -> Option<&StructuredValue> {
        match self {
            Self::Object(props) => props.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for StructuredValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Boolean(b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<f64> for StructuredValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for StructuredValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for StructuredValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for StructuredValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

fn uncloneable(message: impl Into<String>) -> WorkerError {
    WorkerError::UncloneableValue(message.into())
}

/// Step a built-in iterator; `None` once it is done.
fn next_value<F>(mut step: F, context: &mut Context) -> WorkerResult<Option<JsValue>>
where
    F: FnMut(&mut Context) -> JsResult<JsValue>,
{
    let result = step(context).map_err(|e| uncloneable(e.to_string()))?;
    let Some(result) = result.as_object() else {
        return Ok(None);
    };
    let done = result
        .get(js_string!("done"), context)
        .map_err(|e| uncloneable(e.to_string()))?;
    if done.to_boolean() {
        return Ok(None);
    }
    let value = result
        .get(js_string!("value"), context)
        .map_err(|e| uncloneable(e.to_string()))?;
    Ok(Some(value))
}

/// `Object.prototype.toString` style name for error messages
fn tag_of(obj: &JsObject, context: &mut Context) -> String {
    let constructor = obj
        .get(js_string!("constructor"), context)
        .ok()
        .and_then(|c| c.as_object())
        .and_then(|c| c.get(js_string!("name"), context).ok())
        .and_then(|name| name.as_string().map(|s| s.to_std_string_escaped()));
    constructor.filter(|name| !name.is_empty()).unwrap_or_else(|| "exotic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::{Source, js_string};
    use serde_json::json;

    fn eval(context: &mut Context, code: &str) -> JsValue {
        context.eval(Source::from_bytes(code.as_bytes())).unwrap()
    }

    #[test]
    fn test_plain_data_is_copied() {
        let mut context = Context::default();
        let value = eval(&mut context, "({ greeting: 'hello', list: [1, true, null], nested: { n: 2.5 } })");
        let cloned = StructuredValue::from_js(&value, &mut context).unwrap();
        assert_eq!(
            cloned.to_json(),
            json!({ "greeting": "hello", "list": [1, true, null], "nested": { "n": 2.5 } })
        );
    }

    #[test]
    fn test_rebuilt_object_is_a_new_identity() {
        let mut context = Context::default();
        let original = eval(&mut context, "globalThis.original = { a: [1, 2] }; original");
        let cloned = StructuredValue::from_js(&original, &mut context).unwrap();
        let rebuilt = cloned.to_js(&mut context).unwrap();
        context
            .global_object()
            .set(boa_engine::js_string!("rebuilt"), rebuilt, false, &mut context)
            .unwrap();

        let same = eval(&mut context, "rebuilt === original || rebuilt.a === original.a");
        assert_eq!(same.as_boolean(), Some(false));
        let equal = eval(&mut context, "JSON.stringify(rebuilt) === JSON.stringify(original)");
        assert_eq!(equal.as_boolean(), Some(true));
    }

    #[test]
    fn test_key_order_is_preserved() {
        let mut context = Context::default();
        let value = eval(&mut context, "({ z: 1, a: 2, m: 3 })");
        let cloned = StructuredValue::from_js(&value, &mut context).unwrap();
        let StructuredValue::Object(props) = cloned else {
            panic!("expected an object");
        };
        let keys: Vec<_> = props.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn test_functions_are_rejected() {
        let mut context = Context::default();
        let value = eval(&mut context, "({ callback() {} })");
        let err = StructuredValue::from_js(&value, &mut context).unwrap_err();
        assert!(matches!(err, WorkerError::UncloneableValue(_)));
        assert!(err.to_string().starts_with("DataCloneError"));
    }

    #[test]
    fn test_symbols_and_bigints_are_rejected() {
        let mut context = Context::default();
        for code in ["Symbol('s')", "10n", "[1, Symbol.iterator]"] {
            let value = eval(&mut context, code);
            assert!(
                StructuredValue::from_js(&value, &mut context).is_err(),
                "{code} should not clone"
            );
        }
    }

    #[test]
    fn test_promises_are_rejected() {
        let mut context = Context::default();
        let value = eval(&mut context, "Promise.resolve(1)");
        assert!(StructuredValue::from_js(&value, &mut context).is_err());
    }

    #[test]
    fn test_cycles_are_rejected() {
        let mut context = Context::default();
        let value = eval(&mut context, "const a = { name: 'a' }; a.self = a; a");
        let err = StructuredValue::from_js(&value, &mut context).unwrap_err();
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn test_shared_references_are_not_cycles() {
        let mut context = Context::default();
        let value = eval(&mut context, "const shared = { n: 1 }; ({ left: shared, right: shared })");
        let cloned = StructuredValue::from_js(&value, &mut context).unwrap();
        assert_eq!(cloned.to_json(), json!({ "left": { "n": 1 }, "right": { "n": 1 } }));
    }

    #[test]
    fn test_dates_and_regexps_keep_their_type() {
        let mut context = Context::default();
        let value = eval(&mut context, "[new Date(0), /re+/gi]");
        let cloned = StructuredValue::from_js(&value, &mut context).unwrap();
        assert_eq!(
            cloned,
            StructuredValue::Array(vec![
                StructuredValue::Date(0.0),
                StructuredValue::RegExp {
                    source: "re+".to_string(),
                    flags: "gi".to_string(),
                },
            ])
        );

        let rebuilt = cloned.to_js(&mut context).unwrap();
        context
            .global_object()
            .set(js_string!("rebuilt"), rebuilt, false, &mut context)
            .unwrap();
        let check = eval(
            &mut context,
            "rebuilt[0] instanceof Date && rebuilt[0].getTime() === 0 \
             && rebuilt[1] instanceof RegExp && rebuilt[1].source === 're+' && rebuilt[1].flags === 'gi'",
        );
        assert_eq!(check.as_boolean(), Some(true));
    }

    #[test]
    fn test_maps_and_sets_keep_their_entries() {
        let mut context = Context::default();
        let value = eval(
            &mut context,
            "const m = new Map([[1, 'one'], ['two', { n: 2 }]]); m.delete(1); m.set(3, [3]); \
             ({ map: m, set: new Set(['a', 'b', 'a']) })",
        );
        let cloned = StructuredValue::from_js(&value, &mut context).unwrap();
        assert_eq!(
            cloned.get("map"),
            Some(&StructuredValue::Map(vec![
                (
                    "two".into(),
                    StructuredValue::Object(vec![("n".to_string(), 2.0.into())])
                ),
                (3.0.into(), StructuredValue::Array(vec![3.0.into()])),
            ]))
        );
        assert_eq!(cloned.get("set"), Some(&StructuredValue::Set(vec!["a".into(), "b".into()])));

        let rebuilt = cloned.to_js(&mut context).unwrap();
        context
            .global_object()
            .set(js_string!("rebuilt"), rebuilt, false, &mut context)
            .unwrap();
        let check = eval(
            &mut context,
            "rebuilt.map instanceof Map && rebuilt.map.get('two').n === 2 && rebuilt.map.size === 2 \
             && rebuilt.set instanceof Set && rebuilt.set.has('b') && rebuilt.set.size === 2",
        );
        assert_eq!(check.as_boolean(), Some(true));
    }

    #[test]
    fn test_map_containing_itself_is_rejected() {
        let mut context = Context::default();
        let value = eval(&mut context, "const m = new Map(); m.set('self', m); m");
        let err = StructuredValue::from_js(&value, &mut context).unwrap_err();
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn test_other_built_ins_are_rejected() {
        let mut context = Context::default();
        for code in [
            "new Error('boom')",
            "new Uint8Array(4)",
            "new ArrayBuffer(8)",
            "new WeakMap()",
            "new Proxy({}, {})",
            "new Number(1)",
            "({ inner: new TypeError('nested') })",
        ] {
            let value = eval(&mut context, code);
            let err = StructuredValue::from_js(&value, &mut context).unwrap_err();
            assert!(matches!(err, WorkerError::UncloneableValue(_)), "{code}: {err}");
        }
    }

    #[test]
    fn test_class_instances_clone_as_plain_objects() {
        let mut context = Context::default();
        let value = eval(&mut context, "class Point { constructor() { this.x = 1; } } new Point()");
        let cloned = StructuredValue::from_js(&value, &mut context).unwrap();
        assert_eq!(cloned.to_json(), json!({ "x": 1 }));
    }

    #[test]
    fn test_from_serialize() {
        #[derive(Serialize)]
        struct Greeting {
            greeting: &'static str,
            count: u32,
        }

        let value = StructuredValue::from_serialize(&Greeting {
            greeting: "hello",
            count: 3,
        })
        .unwrap();
        assert_eq!(value.get("greeting").and_then(StructuredValue::as_str), Some("hello"));
        assert_eq!(value.get("count").and_then(StructuredValue::as_number), Some(3.0));
    }

    #[test]
    fn test_undefined_maps_to_json_null() {
        let value = StructuredValue::Array(vec![StructuredValue::Undefined, 42.0.into()]);
        assert_eq!(value.to_json(), json!([null, 42]));
    }
}
