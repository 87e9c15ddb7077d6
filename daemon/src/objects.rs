//! Endpoint and session state: the param registry and masked info updates
//!
//! Endpoints and sessions are created by their managing client through the
//! factory and updated through the owner-side resource. Reader-side
//! resources bound on the global enumerate and subscribe to params.

use wavepipe_core::error::WireError;
use wavepipe_core::pod::Value;

use crate::resource::MethodError;
use crate::server::ClientId;

/// Update change mask
pub const UPDATE_PARAMS: u32 = 1 << 0;
pub const UPDATE_INFO: u32 = 1 << 1;

/// Info change mask
pub const CHANGE_STREAMS: u32 = 1 << 0;
pub const CHANGE_SESSION: u32 = 1 << 1;
pub const CHANGE_PROPS: u32 = 1 << 2;
pub const CHANGE_PARAMS: u32 = 1 << 3;
pub const CHANGE_ALL: u32 = 0xf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Endpoint,
    Session,
}

/// The info block emitted to bound resources
#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    /// Global id, filled in at registration
    pub id: u32,
    pub change_mask: u32,
    pub name: String,
    pub media_class: String,
    pub n_streams: u32,
    pub session_id: u32,
    pub props: Vec<(String, String)>,
    /// Available param ids with their flags
    pub param_specs: Vec<(u32, u32)>,
}

impl ObjectInfo {
    /// Wire layout of an info block:
    /// `Struct[Id, Int change_mask, String name, String media_class,
    /// Int n_streams, Int session_id, Struct props, Array param_specs]`
    /// where props alternates key and value strings and every param spec is
    /// `Struct[Id, Int flags]`.
    pub fn marshal(&self) -> Value {
        let mut props = Vec::new();
        for (k, v) in &self.props {
            props.push(Value::String(k.clone()));
            props.push(Value::String(v.clone()));
        }
        let specs = self
            .param_specs
            .iter()
            .map(|(id, flags)| Value::Struct(vec![Value::Id(*id), Value::Int(*flags as i32)]))
            .collect();
        Value::Struct(vec![
            Value::Id(self.id),
            Value::Int(self.change_mask as i32),
            Value::String(self.name.clone()),
            Value::String(self.media_class.clone()),
            Value::Int(self.n_streams as i32),
            Value::Int(self.session_id as i32),
            Value::Struct(props),
            Value::Array(specs),
        ])
    }

    pub fn parse(value: &Value) -> Result<ObjectInfo, MethodError> {
        let fields = value
            .as_struct()
            .ok_or(MethodError::BadMessage("info is not a struct"))?;
        let [id, change_mask, name, media_class, n_streams, session_id, props, specs] = fields
        else {
            return Err(MethodError::BadMessage("info has wrong arity"));
        };
        let mut info = ObjectInfo {
            id: id.as_id().ok_or(MethodError::BadMessage("info id"))?,
            change_mask: change_mask
                .as_int()
                .ok_or(MethodError::BadMessage("info change_mask"))?
                as u32,
            name: name
                .as_str()
                .ok_or(MethodError::BadMessage("info name"))?
                .to_string(),
            media_class: media_class
                .as_str()
                .ok_or(MethodError::BadMessage("info media_class"))?
                .to_string(),
            n_streams: n_streams
                .as_int()
                .ok_or(MethodError::BadMessage("info n_streams"))? as u32,
            session_id: session_id
                .as_int()
                .ok_or(MethodError::BadMessage("info session_id"))? as u32,
            props: Vec::new(),
            param_specs: Vec::new(),
        };
        let prop_fields = props
            .as_struct()
            .ok_or(MethodError::BadMessage("info props"))?;
        for pair in prop_fields.chunks(2) {
            let [k, v] = pair else {
                return Err(MethodError::BadMessage("info props arity"));
            };
            let (Some(k), Some(v)) = (k.as_str(), v.as_str()) else {
                return Err(MethodError::BadMessage("info prop strings"));
            };
            info.props.push((k.to_string(), v.to_string()));
        }
        for spec in specs
            .as_array()
            .ok_or(MethodError::BadMessage("info params"))?
        {
            let fields = spec
                .as_struct()
                .ok_or(MethodError::BadMessage("info param spec"))?;
            let [id, flags] = fields else {
                return Err(MethodError::BadMessage("info param spec arity"));
            };
            let (Some(id), Some(flags)) = (id.as_id(), flags.as_int()) else {
                return Err(MethodError::BadMessage("info param spec fields"));
            };
            info.param_specs.push((id, flags as u32));
        }
        Ok(info)
    }
}

/// The server-side state behind one endpoint or session global
#[derive(Debug)]
pub struct ObjectState {
    pub kind: ObjectKind,
    /// Client and resource id of the owner-side handle that updates us;
    /// `None` for objects the daemon itself manages
    pub owner: Option<(ClientId, u32)>,
    pub params: Vec<Option<Value>>,
    pub info: ObjectInfo,
}

impl ObjectState {
    pub fn new(kind: ObjectKind, owner: Option<(ClientId, u32)>) -> Self {
        Self {
            kind,
            owner,
            params: Vec::new(),
            info: ObjectInfo::default(),
        }
    }

    /// Installs a new param list, returning the indices to notify.
    /// Every entry must be an object; on failure the list is cleared and
    /// the error reported on the owner resource.
    pub fn replace_params(&mut self, params: Vec<Value>) -> Result<Vec<u32>, WireError> {
        if let Some(bad) = params.iter().find(|p| p.object_id().is_none()) {
            self.params.clear();
            return Err(WireError::invalid(format!(
                "param is not an object: {bad:?}"
            )));
        }
        self.params = params.into_iter().map(Some).collect();
        Ok((0..self.params.len() as u32).collect())
    }

    /// Applies the individually masked fields of an info update. The
    /// emitted change mask mirrors the update; the caller clears it on the
    /// owner after emission.
    pub fn apply_info(&mut self, update: &ObjectInfo) {
        if update.change_mask & CHANGE_STREAMS != 0 {
            self.info.n_streams = update.n_streams;
        }
        if update.change_mask & CHANGE_SESSION != 0 {
            self.info.session_id = update.session_id;
        }
        if update.change_mask & CHANGE_PROPS != 0 {
            for (k, v) in &update.props {
                match self.info.props.iter_mut().find(|(key, _)| key == k) {
                    Some((_, value)) => *value = v.clone(),
                    None => self.info.props.push((k.clone(), v.clone())),
                }
            }
        }
        if update.change_mask & CHANGE_PARAMS != 0 {
            self.info.param_specs = update.param_specs.clone();
        }
        if self.info.name.is_empty() {
            self.info.name = update.name.clone();
            self.info.media_class = update.media_class.clone();
        }
        self.info.change_mask = update.change_mask;
    }

    /// Walks `params[start..]`, keeping entries whose object id is `id` and
    /// which match `filter`, yielding `(index, next, param)` up to `num`
    /// entries. Entries that fail the filter do not advance the count.
    pub fn enum_params<'a>(
        &'a self,
        id: u32,
        start: u32,
        num: u32,
        filter: Option<&Value>,
    ) -> Vec<(u32, u32, &'a Value)> {
        let mut out = Vec::new();
        let mut next = start;
        loop {
            let index = next;
            next += 1;
            let Some(slot) = self.params.get(index as usize) else {
                break;
            };
            let Some(param) = slot else { continue };
            if param.object_id() != Some(id) {
                continue;
            }
            if let Some(filter) = filter {
                if !param.matches(filter) {
                    continue;
                }
            }
            out.push((index, next, param));
            if out.len() as u32 == num {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use wavepipe_core::pod::ObjectValue;

    use super::*;

    fn param(object_id: u32, key: u32, value: i32) -> Value {
        Value::Object(ObjectValue::new(object_id).prop(key, Value::Int(value)))
    }

    fn state_with_params(params: Vec<Value>) -> ObjectState {
        let mut state = ObjectState::new(ObjectKind::Endpoint, Some((0, 2)));
        state.replace_params(params).unwrap();
        state
    }

    #[test]
    fn test_replace_params_notifies_every_index() {
        let mut state = ObjectState::new(ObjectKind::Endpoint, Some((0, 2)));
        let changed = state
            .replace_params(vec![param(1, 0, 10), param(2, 0, 20)])
            .unwrap();
        assert_eq!(changed, vec![0, 1]);
    }

    #[test]
    fn test_replace_params_rejects_non_objects() {
        let mut state = state_with_params(vec![param(1, 0, 10)]);
        let err = state
            .replace_params(vec![param(1, 0, 10), Value::Int(3)])
            .unwrap_err();
        assert_eq!(err.errno, libc::EINVAL);
        // failed update leaves no params behind
        assert!(state.params.is_empty());
    }

    #[test]
    fn test_enum_params_nil_filter_visits_in_order() {
        let state = state_with_params(vec![
            param(1, 0, 10),
            param(2, 0, 20),
            param(1, 0, 30),
        ]);
        let hits = state.enum_params(1, 0, u32::MAX, None);
        let indices: Vec<u32> = hits.iter().map(|(i, _, _)| *i).collect();
        assert_eq!(indices, vec![0, 2]);
        // next always points one past the visited index
        assert!(hits.iter().all(|(i, n, _)| *n == *i + 1));
    }

    #[test]
    fn test_enum_params_respects_start_and_num() {
        let state = state_with_params(vec![
            param(1, 0, 10),
            param(1, 0, 20),
            param(1, 0, 30),
        ]);
        let hits = state.enum_params(1, 1, 1, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
    }

    #[test]
    fn test_enum_params_filter_skips_without_counting() {
        let state = state_with_params(vec![
            param(1, 5, 10),
            param(1, 5, 20),
            param(1, 5, 20),
        ]);
        let filter = Value::Object(ObjectValue::new(1).prop(5, Value::Int(20)));
        let hits = state.enum_params(1, 0, 2, Some(&filter));
        let indices: Vec<u32> = hits.iter().map(|(i, _, _)| *i).collect();
        assert_eq!(indices, vec![1, 2]);
    }

    #[test]
    fn test_apply_info_is_masked() {
        let mut state = ObjectState::new(ObjectKind::Session, Some((0, 2)));
        state.apply_info(&ObjectInfo {
            change_mask: CHANGE_STREAMS,
            name: "ep0".into(),
            media_class: "Audio/Sink".into(),
            n_streams: 2,
            session_id: 9,
            ..Default::default()
        });
        assert_eq!(state.info.n_streams, 2);
        // session bit was not set, the field keeps its value
        assert_eq!(state.info.session_id, 0);
        // first update installs the immutable identity
        assert_eq!(state.info.name, "ep0");

        state.apply_info(&ObjectInfo {
            change_mask: CHANGE_SESSION,
            name: "renamed".into(),
            session_id: 4,
            ..Default::default()
        });
        assert_eq!(state.info.session_id, 4);
        assert_eq!(state.info.name, "ep0");
    }

    #[test]
    fn test_info_marshal_roundtrip() {
        let info = ObjectInfo {
            id: 7,
            change_mask: CHANGE_ALL,
            name: "ep0".into(),
            media_class: "Audio/Sink".into(),
            n_streams: 1,
            session_id: 3,
            props: vec![("media.role".into(), "Music".into())],
            param_specs: vec![(4, 3)],
        };
        let parsed = ObjectInfo::parse(&info.marshal()).unwrap();
        assert_eq!(parsed.id, info.id);
        assert_eq!(parsed.props, info.props);
        assert_eq!(parsed.param_specs, info.param_specs);
    }
}
