use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    ComponentId,
    Dimension,
    Material,
    Axis,
    /// A component located by the vision model without a readable code.
    Component,
    Unknown,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::ComponentId => "component_id",
            EntityKind::Dimension => "dimension",
            EntityKind::Material => "material",
            EntityKind::Axis => "axis",
            EntityKind::Component => "component",
            EntityKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentClass {
    Column,
    Beam,
    Slab,
    Wall,
    Foundation,
    Stair,
    Opening,
}

impl ComponentClass {
    pub const ALL: [ComponentClass; 7] = [
        ComponentClass::Column,
        ComponentClass::Beam,
        ComponentClass::Slab,
        ComponentClass::Wall,
        ComponentClass::Foundation,
        ComponentClass::Stair,
        ComponentClass::Opening,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentClass::Column => "column",
            ComponentClass::Beam => "beam",
            ComponentClass::Slab => "slab",
            ComponentClass::Wall => "wall",
            ComponentClass::Foundation => "foundation",
            ComponentClass::Stair => "stair",
            ComponentClass::Opening => "opening",
        }
    }

    /// Parses a vision model's type name, accepting common synonyms.
    pub fn parse(name: &str) -> Option<Self> {
        let lower = name.trim().to_lowercase();
        let class = match lower.as_str() {
            "column" | "columns" | "pillar" | "post" => ComponentClass::Column,
            "beam" | "beams" | "girder" | "joist" | "lintel" => ComponentClass::Beam,
            "slab" | "slabs" | "floor" | "floor_slab" | "roof_slab" => ComponentClass::Slab,
            "wall" | "walls" | "shear_wall" | "partition" => ComponentClass::Wall,
            "foundation" | "footing" | "pile_cap" | "pile cap" | "raft" => {
                ComponentClass::Foundation
            }
            "stair" | "stairs" | "staircase" | "stairway" => ComponentClass::Stair,
            "opening" | "door" | "window" | "hole" => ComponentClass::Opening,
            _ => return None,
        };
        Some(class)
    }

    /// Component class implied by a drawing code prefix such as `KZ` or `LB`.
    pub fn from_code_prefix(prefix: &str) -> Option<Self> {
        let class = match prefix {
            "KZ" | "KZZ" | "GZ" | "XZ" | "LZ" | "Z" => ComponentClass::Column,
            "KL" | "WKL" | "KZL" | "JZL" | "LL" | "XL" | "JL" | "L" => ComponentClass::Beam,
            "B" | "LB" | "WB" | "XB" | "YB" => ComponentClass::Slab,
            "Q" | "JLQ" | "DWQ" => ComponentClass::Wall,
            "J" | "DJ" | "DJJ" | "DJP" | "CT" | "ZJ" => ComponentClass::Foundation,
            "LT" | "TB" | "AT" | "BT" => ComponentClass::Stair,
            "M" | "C" | "MC" | "DK" => ComponentClass::Opening,
            _ => return None,
        };
        Some(class)
    }
}

impl fmt::Display for ComponentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: EntityKind,
    pub class: Option<ComponentClass>,
    pub attributes: BTreeMap<String, String>,
}

impl Classification {
    fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            class: None,
            attributes: BTreeMap::new(),
        }
    }

    fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Classifies a recognized string; `vision_type` is the type the vision
/// model reported, if any.
pub fn classify(text: &str, vision_type: Option<&str>) -> Classification {
    let compact = text
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>()
        .to_uppercase();

    let mut result = if compact.is_empty() {
        Classification::new(EntityKind::Unknown)
    } else if let Some(found) = material(&compact) {
        found
    } else if let Some(found) = dimension(&compact) {
        found
    } else if let Some(found) = axis(&compact) {
        found
    } else if let Some(found) = component_code(&compact) {
        found
    } else {
        Classification::new(EntityKind::Unknown)
    };

    if let Some(class) = vision_type.and_then(ComponentClass::parse) {
        if !matches!(result.kind, EntityKind::ComponentId) {
            result = Classification::new(EntityKind::Component);
        }
        result.class = Some(class);
        result
            .attributes
            .insert("class".to_string(), class.as_str().to_string());
    }
    result
}

fn material(text: &str) -> Option<Classification> {
    for (keyword, family) in [
        ("CONCRETE", "concrete"),
        ("REBAR", "steel"),
        ("STEEL", "steel"),
        ("MORTAR", "mortar"),
    ] {
        if text.contains(keyword) {
            return Some(Classification::new(EntityKind::Material).with("material", family));
        }
    }

    let (prefix, digits, rest) = split_code(text)?;
    if !rest.is_empty() {
        return None;
    }
    let value: u32 = digits.parse().ok()?;
    let family = match prefix {
        "C" if digits.len() == 2 && (10..=100).contains(&value) => "concrete",
        "HRB" | "HPB" | "HRBF" | "RRB" if digits.len() == 3 => "steel",
        "Q" if digits.len() == 3 && value >= 195 => "steel",
        "MU" if digits.len() <= 2 => "masonry",
        _ => return None,
    };
    Some(
        Classification::new(EntityKind::Material)
            .with("material", family)
            .with("grade", text),
    )
}

fn dimension(text: &str) -> Option<Classification> {
    // Rebar callouts: Ø12@200, %%C12@200
    let rebar = text
        .strip_prefix('Ø')
        .or_else(|| text.strip_prefix('Φ'))
        .or_else(|| text.strip_prefix('φ'))
        .or_else(|| text.strip_prefix("%%C"));
    if let Some(rest) = rebar {
        let (diameter, spacing) = rest.split_once('@').unwrap_or((rest, ""));
        if is_number(diameter) && (spacing.is_empty() || is_number(spacing)) {
            let mut found = Classification::new(EntityKind::Dimension).with("diameter", diameter);
            if !spacing.is_empty() {
                found = found.with("spacing", spacing);
            }
            return Some(found);
        }
    }

    let body = text
        .strip_prefix("L=")
        .or_else(|| text.strip_prefix("H="))
        .or_else(|| text.strip_prefix("R="))
        .unwrap_or(text);
    let (value, unit) = strip_unit(body);

    for separator in ['X', '×', '*'] {
        if let Some((width, height)) = value.split_once(separator)
            && is_number(width)
            && is_number(height)
        {
            return Some(
                Classification::new(EntityKind::Dimension)
                    .with("width", width)
                    .with("height", height),
            );
        }
    }

    if is_number(value) && (value.len() >= 3 || !unit.is_empty() || body.len() != text.len()) {
        let mut found = Classification::new(EntityKind::Dimension).with("value", value);
        if !unit.is_empty() {
            found = found.with("unit", unit.to_lowercase());
        }
        return Some(found);
    }
    None
}

fn axis(text: &str) -> Option<Classification> {
    let is_letter_axis = |value: &str| {
        let mut chars = value.chars();
        matches!(chars.next(), Some(ch) if ch.is_ascii_uppercase()) && chars.all(|ch| ch == '\'')
    };
    let is_number_axis = |value: &str| {
        !value.is_empty() && value.len() <= 2 && value.chars().all(|ch| ch.is_ascii_digit())
    };

    let matched = if let Some((left, right)) = text.split_once('/') {
        (is_number_axis(left) || is_letter_axis(left))
            && (is_number_axis(right) || is_letter_axis(right))
    } else {
        is_number_axis(text) || is_letter_axis(text)
    };
    matched.then(|| Classification::new(EntityKind::Axis).with("axis", text))
}

fn component_code(text: &str) -> Option<Classification> {
    let (prefix, digits, rest) = split_code(text)?;
    let count = match rest {
        "" => None,
        _ => {
            let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
            let inner = inner.trim_end_matches(['A', 'B']);
            if !is_number(inner) {
                return None;
            }
            Some(inner.to_string())
        }
    };

    let mut found = Classification::new(EntityKind::ComponentId)
        .with("code", text)
        .with("prefix", prefix)
        .with("number", digits);
    if let Some(count) = count {
        found = found.with("spans", count);
    }
    if let Some(class) = ComponentClass::from_code_prefix(prefix) {
        found.class = Some(class);
        found = found.with("class", class.as_str());
    }
    Some(found)
}

/// Splits `KZ-12(3)` into (`KZ`, `12`, `(3)`). Requires a letter prefix and
/// at least one digit.
fn split_code(text: &str) -> Option<(&str, &str, &str)> {
    let prefix_end = text
        .find(|ch: char| !ch.is_ascii_uppercase())
        .unwrap_or(text.len());
    if prefix_end == 0 || prefix_end > 4 {
        return None;
    }
    let prefix = &text[..prefix_end];
    let after = &text[prefix_end..];
    let after = after.strip_prefix('-').unwrap_or(after);
    let digits_end = after
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(after.len());
    if digits_end == 0 {
        return None;
    }
    Some((prefix, &after[..digits_end], &after[digits_end..]))
}

fn strip_unit(value: &str) -> (&str, &str) {
    for unit in ["MM", "CM", "M"] {
        if let Some(stripped) = value.strip_suffix(unit)
            && !stripped.is_empty()
        {
            return (stripped, unit);
        }
    }
    (value, "")
}

fn is_number(value: &str) -> bool {
    !value.is_empty()
        && value.chars().all(|ch| ch.is_ascii_digit() || ch == '.')
        && value.chars().any(|ch| ch.is_ascii_digit())
        && value.matches('.').count() <= 1
}
