//! Typed state records decoded from control lines.
//!
//! A state is immutable once it leaves the read stage; chained generation
//! clones it and re-applies the `next` override map, so new fields win
//! exactly like a dict spread would.
use thiserror::Error;

use crate::control::Value;

#[derive(Error, Debug, PartialEq)]
pub enum StateError {
    #[error("Field '{0}' has the wrong type")]
    BadField(&'static str),
}

/// Fields shared by the image and sound pipelines.
#[derive(Debug, Clone, PartialEq)]
pub struct Control {
    pub version: u64,
    pub tags: String,
    pub description: String,
    pub stop: bool,
    pub skip: bool,
    pub empty: bool,
    pub looping: bool,
    pub full: bool,
    /// Disk directory for the prompt embedding cache; empty keeps it in
    /// process memory.
    pub cache: String,
    /// Disk path for a seed payload.
    pub load: Option<String>,
    /// Base64 inline seed payload.
    pub data: Option<String>,
    /// (height, width) of an inline or ring payload.
    pub shape: Option<(usize, usize)>,
    pub offset: usize,
    pub size: usize,
    pub generation: u64,
    pub cancel: Vec<u64>,
    pub pause: Vec<u64>,
    pub resume: Vec<u64>,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            version: 0,
            tags: String::new(),
            description: String::new(),
            stop: false,
            skip: false,
            empty: false,
            looping: false,
            // Absent means the host wants the whole pipeline
            full: true,
            cache: String::new(),
            load: None,
            data: None,
            shape: None,
            offset: 0,
            size: 0,
            generation: 0,
            cancel: Vec::new(),
            pause: Vec::new(),
            resume: Vec::new(),
        }
    }
}

fn versions(value: &Value, field: &'static str) -> Result<Vec<u64>, StateError> {
    value
        .as_list()
        .ok_or(StateError::BadField(field))?
        .iter()
        .map(|v| v.as_u64().ok_or(StateError::BadField(field)))
        .collect()
}

/// Empty strings and `None` both mean "not given" for path-like fields.
fn optional_str(value: &Value, field: &'static str) -> Result<Option<String>, StateError> {
    match value {
        Value::None => Ok(None),
        Value::Str(s) if s.is_empty() => Ok(None),
        Value::Str(s) => Ok(Some(s.clone())),
        _ => Err(StateError::BadField(field)),
    }
}

impl Control {
    fn apply(&mut self, map: &Value) -> Result<(), StateError> {
        if let Some(v) = map.get("version") {
            self.version = v.as_u64().ok_or(StateError::BadField("version"))?;
        }
        if let Some(v) = map.get("tags") {
            self.tags = v
                .as_str()
                .ok_or(StateError::BadField("tags"))?
                .to_string();
        }
        if let Some(v) = map.get("description") {
            self.description = v
                .as_str()
                .ok_or(StateError::BadField("description"))?
                .to_string();
        }
        if let Some(v) = map.get("stop") {
            self.stop = v.truthy();
        }
        if let Some(v) = map.get("skip") {
            self.skip = v.truthy();
        }
        if let Some(v) = map.get("empty") {
            self.empty = v.truthy();
        }
        if let Some(v) = map.get("loop") {
            self.looping = v.truthy();
        }
        if let Some(v) = map.get("full") {
            self.full = v.truthy();
        }
        if let Some(v) = map.get("cache") {
            self.cache = match v {
                Value::None => String::new(),
                Value::Str(s) => s.clone(),
                _ => return Err(StateError::BadField("cache")),
            };
        }
        if let Some(v) = map.get("load") {
            self.load = optional_str(v, "load")?;
        }
        if let Some(v) = map.get("data") {
            self.data = optional_str(v, "data")?;
        }
        if let Some(v) = map.get("shape") {
            self.shape = match v {
                Value::None => None,
                Value::List(items) if items.len() == 2 => {
                    let h = items[0].as_u64().ok_or(StateError::BadField("shape"))?;
                    let w = items[1].as_u64().ok_or(StateError::BadField("shape"))?;
                    Some((h as usize, w as usize))
                }
                _ => return Err(StateError::BadField("shape")),
            };
        }
        if let Some(v) = map.get("offset") {
            self.offset = v.as_u64().ok_or(StateError::BadField("offset"))? as usize;
        }
        if let Some(v) = map.get("size") {
            self.size = v.as_u64().ok_or(StateError::BadField("size"))? as usize;
        }
        if let Some(v) = map.get("generation") {
            self.generation = v.as_u64().ok_or(StateError::BadField("generation"))?;
        }
        if let Some(v) = map.get("cancel") {
            self.cancel = versions(v, "cancel")?;
        }
        if let Some(v) = map.get("pause") {
            self.pause = versions(v, "pause")?;
        }
        if let Some(v) = map.get("resume") {
            self.resume = versions(v, "resume")?;
        }
        Ok(())
    }
}

/// One image generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageState {
    pub control: Control,
    pub width: usize,
    pub height: usize,
    pub zoom: i64,
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
    pub positive: String,
    pub negative: String,
    pub steps: u32,
    pub guidance: f32,
    pub denoise: f32,
    /// Raw override map for chained generation; merged when the current
    /// request finishes.
    pub next: Option<Value>,
    /// Interpolation cascade as (scale, multiplier) passes.
    pub interpolations: Vec<(f32, u32)>,
}

impl Default for ImageState {
    fn default() -> Self {
        Self {
            control: Control::default(),
            width: 512,
            height: 512,
            zoom: 0,
            left: 0,
            top: 0,
            right: 0,
            bottom: 0,
            positive: String::new(),
            negative: String::new(),
            steps: 5,
            guidance: 2.5,
            denoise: 0.55,
            next: None,
            interpolations: vec![(0.25, 6), (1.0, 12)],
        }
    }
}

impl ImageState {
    pub fn from_value(map: &Value) -> Result<Self, StateError> {
        let mut state = Self::default();
        state.apply(map)?;
        Ok(state)
    }

    /// `{**state, **next}`: the override map wins field by field.
    pub fn merged(&self, next: &Value) -> Result<Self, StateError> {
        let mut state = self.clone();
        state.next = None;
        state.apply(next)?;
        Ok(state)
    }

    fn apply(&mut self, map: &Value) -> Result<(), StateError> {
        self.control.apply(map)?;
        if let Some(v) = map.get("width") {
            self.width = v.as_u64().ok_or(StateError::BadField("width"))? as usize;
        }
        if let Some(v) = map.get("height") {
            self.height = v.as_u64().ok_or(StateError::BadField("height"))? as usize;
        }
        if let Some(v) = map.get("zoom") {
            self.zoom = v.as_i64().ok_or(StateError::BadField("zoom"))?;
        }
        if let Some(v) = map.get("left") {
            self.left = v.as_i64().ok_or(StateError::BadField("left"))?;
        }
        if let Some(v) = map.get("top") {
            self.top = v.as_i64().ok_or(StateError::BadField("top"))?;
        }
        if let Some(v) = map.get("right") {
            self.right = v.as_i64().ok_or(StateError::BadField("right"))?;
        }
        if let Some(v) = map.get("bottom") {
            self.bottom = v.as_i64().ok_or(StateError::BadField("bottom"))?;
        }
        if let Some(v) = map.get("positive") {
            self.positive = v
                .as_str()
                .ok_or(StateError::BadField("positive"))?
                .to_string();
        }
        if let Some(v) = map.get("negative") {
            self.negative = v
                .as_str()
                .ok_or(StateError::BadField("negative"))?
                .to_string();
        }
        if let Some(v) = map.get("steps") {
            self.steps = v.as_u64().ok_or(StateError::BadField("steps"))? as u32;
        }
        if let Some(v) = map.get("guidance") {
            self.guidance = v.as_f64().ok_or(StateError::BadField("guidance"))? as f32;
        }
        if let Some(v) = map.get("denoise") {
            self.denoise = v.as_f64().ok_or(StateError::BadField("denoise"))? as f32;
        }
        if let Some(v) = map.get("next") {
            self.next = match v {
                Value::None => None,
                Value::Map(_) => Some(v.clone()),
                _ => return Err(StateError::BadField("next")),
            };
        }
        if let Some(v) = map.get("interpolations") {
            let passes = v
                .as_list()
                .ok_or(StateError::BadField("interpolations"))?
                .iter()
                .map(|pass| {
                    let pair = pass
                        .as_list()
                        .filter(|p| p.len() == 2)
                        .ok_or(StateError::BadField("interpolations"))?;
                    let scale = pair[0]
                        .as_f64()
                        .ok_or(StateError::BadField("interpolations"))?;
                    let multiplier = pair[1]
                        .as_u64()
                        .ok_or(StateError::BadField("interpolations"))?;
                    Ok((scale as f32, multiplier as u32))
                })
                .collect::<Result<Vec<_>, StateError>>()?;
            self.interpolations = passes;
        }
        Ok(())
    }
}

/// One audio generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct SoundState {
    pub control: Control,
    pub prompts: Vec<String>,
    pub duration: f32,
    pub overlap: f32,
}

impl Default for SoundState {
    fn default() -> Self {
        Self {
            control: Control::default(),
            prompts: Vec::new(),
            duration: 10.0,
            overlap: 0.5,
        }
    }
}

impl SoundState {
    pub fn from_value(map: &Value) -> Result<Self, StateError> {
        let mut state = Self::default();
        state.control.apply(map)?;
        if let Some(v) = map.get("prompts") {
            state.prompts = v
                .as_list()
                .ok_or(StateError::BadField("prompts"))?
                .iter()
                .map(|p| {
                    p.as_str()
                        .map(str::to_string)
                        .ok_or(StateError::BadField("prompts"))
                })
                .collect::<Result<Vec<_>, _>>()?;
        }
        if let Some(v) = map.get("duration") {
            state.duration = v.as_f64().ok_or(StateError::BadField("duration"))? as f32;
        }
        if let Some(v) = map.get("overlap") {
            state.overlap = v.as_f64().ok_or(StateError::BadField("overlap"))? as f32;
        }
        Ok(state)
    }
}
