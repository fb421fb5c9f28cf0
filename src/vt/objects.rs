//! The typed VT object graph and the IOP parser that builds it
//!
//! Every serialized IOP object starts with the same three bytes:
//!
//! | Bytes 0..=1      | Byte 2      | Bytes 3..        |
//! |------------------|-------------|------------------|
//! | object ID (LE)   | object type | type-specific    |
//!
//! The type-specific tail is a fixed header followed by optional variable parts (child object
//! placements, macro references, string values). Object types are from ISO 11783-6; the subset
//! here covers the masks, containers, inputs, outputs, variables, and attribute objects that make
//! up ordinary implement pools.

use std::collections::HashSet;

use eyre::WrapErr;

/// Placement of a child object within a parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRef {
    pub object_id: u16,
    pub x: i16,
    pub y: i16,
}

/// Binding of a macro to one of the parent's events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacroRef {
    pub event_id: u8,
    pub macro_id: u8,
}

/// One parsed IOP object
#[derive(Debug, Clone, PartialEq)]
pub enum VtObject {
    WorkingSet {
        id: u16,
        background_colour: u8,
        selectable: bool,
        active_mask: u16,
        children: Vec<ChildRef>,
        macros: Vec<MacroRef>,
        languages: Vec<[u8; 2]>,
    },
    DataMask {
        id: u16,
        background_colour: u8,
        soft_key_mask: u16,
        children: Vec<ChildRef>,
        macros: Vec<MacroRef>,
    },
    AlarmMask {
        id: u16,
        background_colour: u8,
        soft_key_mask: u16,
        priority: u8,
        acoustic_signal: u8,
        children: Vec<ChildRef>,
        macros: Vec<MacroRef>,
    },
    Container {
        id: u16,
        width: u16,
        height: u16,
        hidden: bool,
        children: Vec<ChildRef>,
        macros: Vec<MacroRef>,
    },
    SoftKeyMask {
        id: u16,
        background_colour: u8,
        keys: Vec<u16>,
        macros: Vec<MacroRef>,
    },
    Key {
        id: u16,
        background_colour: u8,
        key_code: u8,
        children: Vec<ChildRef>,
        macros: Vec<MacroRef>,
    },
    Button {
        id: u16,
        width: u16,
        height: u16,
        background_colour: u8,
        border_colour: u8,
        key_code: u8,
        options: u8,
        children: Vec<ChildRef>,
        macros: Vec<MacroRef>,
    },
    InputBoolean {
        id: u16,
        background_colour: u8,
        width: u16,
        foreground_colour: u16,
        variable_reference: u16,
        value: bool,
        enabled: bool,
        macros: Vec<MacroRef>,
    },
    InputString {
        id: u16,
        width: u16,
        height: u16,
        background_colour: u8,
        font_attributes: u16,
        input_attributes: u16,
        options: u8,
        variable_reference: u16,
        justification: u8,
        value: Vec<u8>,
        enabled: bool,
        macros: Vec<MacroRef>,
    },
    InputNumber {
        id: u16,
        width: u16,
        height: u16,
        background_colour: u8,
        font_attributes: u16,
        options: u8,
        variable_reference: u16,
        value: u32,
        min_value: u32,
        max_value: u32,
        offset: i32,
        scale: f32,
        number_of_decimals: u8,
        format: u8,
        justification: u8,
        options2: u8,
        macros: Vec<MacroRef>,
    },
    OutputString {
        id: u16,
        width: u16,
        height: u16,
        background_colour: u8,
        font_attributes: u16,
        options: u8,
        variable_reference: u16,
        justification: u8,
        value: Vec<u8>,
        macros: Vec<MacroRef>,
    },
    OutputNumber {
        id: u16,
        width: u16,
        height: u16,
        background_colour: u8,
        font_attributes: u16,
        options: u8,
        variable_reference: u16,
        value: u32,
        offset: i32,
        scale: f32,
        number_of_decimals: u8,
        format: u8,
        justification: u8,
        macros: Vec<MacroRef>,
    },
    OutputLine {
        id: u16,
        line_attributes: u16,
        width: u16,
        height: u16,
        line_direction: u8,
        macros: Vec<MacroRef>,
    },
    OutputRectangle {
        id: u16,
        line_attributes: u16,
        width: u16,
        height: u16,
        line_suppression: u8,
        fill_attributes: u16,
        macros: Vec<MacroRef>,
    },
    NumberVariable {
        id: u16,
        value: u32,
    },
    StringVariable {
        id: u16,
        value: Vec<u8>,
    },
    FontAttributes {
        id: u16,
        font_colour: u8,
        font_size: u8,
        font_type: u8,
        font_style: u8,
        macros: Vec<MacroRef>,
    },
    LineAttributes {
        id: u16,
        line_colour: u8,
        line_width: u8,
        line_art: u16,
        macros: Vec<MacroRef>,
    },
    FillAttributes {
        id: u16,
        fill_type: u8,
        fill_colour: u8,
        fill_pattern: u16,
        macros: Vec<MacroRef>,
    },
    ObjectPointer {
        id: u16,
        value: u16,
    },
    Macro {
        id: u16,
        commands: Vec<u8>,
    },
}

impl VtObject {
    /// The 16-bit object ID, unique within a working set
    #[must_use]
    pub fn id(&self) -> u16 {
        match *self {
            VtObject::WorkingSet { id, .. }
            | VtObject::DataMask { id, .. }
            | VtObject::AlarmMask { id, .. }
            | VtObject::Container { id, .. }
            | VtObject::SoftKeyMask { id, .. }
            | VtObject::Key { id, .. }
            | VtObject::Button { id, .. }
            | VtObject::InputBoolean { id, .. }
            | VtObject::InputString { id, .. }
            | VtObject::InputNumber { id, .. }
            | VtObject::OutputString { id, .. }
            | VtObject::OutputNumber { id, .. }
            | VtObject::OutputLine { id, .. }
            | VtObject::OutputRectangle { id, .. }
            | VtObject::NumberVariable { id, .. }
            | VtObject::StringVariable { id, .. }
            | VtObject::FontAttributes { id, .. }
            | VtObject::LineAttributes { id, .. }
            | VtObject::FillAttributes { id, .. }
            | VtObject::ObjectPointer { id, .. }
            | VtObject::Macro { id, .. } => id,
        }
    }
}

/// Bounds-checked little-endian reader over one object's bytes
struct Reader<'a> {
    data: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    fn take(&mut self, n: usize) -> eyre::Result<&'a [u8]> {
        if self.cursor + n > self.data.len() {
            eyre::bail!(
                "Truncated object: wanted {n} bytes at offset {}, have {}",
                self.cursor,
                self.data.len() - self.cursor
            );
        }
        let slice = &self.data[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    fn u8(&mut self) -> eyre::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> eyre::Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => eyre::bail!("Expected a boolean attribute, got {other}"),
        }
    }

    fn u16(&mut self) -> eyre::Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn i16(&mut self) -> eyre::Result<i16> {
        let bytes = self.take(2)?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> eyre::Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> eyre::Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn f32(&mut self) -> eyre::Result<f32> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn children(&mut self, count: usize) -> eyre::Result<Vec<ChildRef>> {
        let mut children = Vec::with_capacity(count);
        for _ in 0..count {
            children.push(ChildRef {
                object_id: self.u16()?,
                x: self.i16()?,
                y: self.i16()?,
            });
        }
        Ok(children)
    }

    fn macros(&mut self, count: usize) -> eyre::Result<Vec<MacroRef>> {
        let mut macros = Vec::with_capacity(count);
        for _ in 0..count {
            macros.push(MacroRef {
                event_id: self.u8()?,
                macro_id: self.u8()?,
            });
        }
        Ok(macros)
    }
}

/// Parse a whole IOP blob into its object list
///
/// Fails on an unknown object type, a truncated buffer, a duplicate object ID, or an attribute
/// outside its legal range; the caller discards any partially built list.
pub fn parse_iop_into_objects(data: &[u8]) -> eyre::Result<Vec<VtObject>> {
    let mut objects = Vec::new();
    let mut seen_ids = HashSet::new();
    let mut cursor = 0;
    while cursor < data.len() {
        let (object, consumed) = parse_iop_object(&data[cursor..])
            .wrap_err_with(|| format!("Failed to parse IOP object at offset {cursor}"))?;
        if !seen_ids.insert(object.id()) {
            eyre::bail!("Duplicate object ID {:#06X} at offset {cursor}", object.id());
        }
        cursor += consumed;
        objects.push(object);
    }
    tracing::debug!("Parsed IOP pool. objects: {}", objects.len());
    Ok(objects)
}

/// Parse one object from the front of `data`, returning it and the number of bytes it occupied
pub(crate) fn parse_iop_object(data: &[u8]) -> eyre::Result<(VtObject, usize)> {
    let mut r = Reader::new(data);
    let id = r.u16()?;
    let object_type = r.u8()?;

    let object = match object_type {
        0 => {
            let background_colour = r.u8()?;
            let selectable = r.bool()?;
            let active_mask = r.u16()?;
            let num_children = r.u8()? as usize;
            let num_macros = r.u8()? as usize;
            let num_languages = r.u8()? as usize;
            let children = r.children(num_children)?;
            let macros = r.macros(num_macros)?;
            let mut languages = Vec::with_capacity(num_languages);
            for _ in 0..num_languages {
                let code = r.take(2)?;
                languages.push([code[0], code[1]]);
            }
            VtObject::WorkingSet {
                id,
                background_colour,
                selectable,
                active_mask,
                children,
                macros,
                languages,
            }
        }
        1 => {
            let background_colour = r.u8()?;
            let soft_key_mask = r.u16()?;
            let num_children = r.u8()? as usize;
            let num_macros = r.u8()? as usize;
            VtObject::DataMask {
                id,
                background_colour,
                soft_key_mask,
                children: r.children(num_children)?,
                macros: r.macros(num_macros)?,
            }
        }
        2 => {
            let background_colour = r.u8()?;
            let soft_key_mask = r.u16()?;
            let priority = r.u8()?;
            if priority > 2 {
                eyre::bail!("Alarm mask priority {priority} out of range 0..=2");
            }
            let acoustic_signal = r.u8()?;
            if acoustic_signal > 3 {
                eyre::bail!("Alarm mask acoustic signal {acoustic_signal} out of range 0..=3");
            }
            let num_children = r.u8()? as usize;
            let num_macros = r.u8()? as usize;
            VtObject::AlarmMask {
                id,
                background_colour,
                soft_key_mask,
                priority,
                acoustic_signal,
                children: r.children(num_children)?,
                macros: r.macros(num_macros)?,
            }
        }
        3 => {
            let width = r.u16()?;
            let height = r.u16()?;
            let hidden = r.bool()?;
            let num_children = r.u8()? as usize;
            let num_macros = r.u8()? as usize;
            VtObject::Container {
                id,
                width,
                height,
                hidden,
                children: r.children(num_children)?,
                macros: r.macros(num_macros)?,
            }
        }
        4 => {
            let background_colour = r.u8()?;
            let num_keys = r.u8()? as usize;
            let num_macros = r.u8()? as usize;
            let mut keys = Vec::with_capacity(num_keys);
            for _ in 0..num_keys {
                keys.push(r.u16()?);
            }
            VtObject::SoftKeyMask {
                id,
                background_colour,
                keys,
                macros: r.macros(num_macros)?,
            }
        }
        5 => {
            let background_colour = r.u8()?;
            let key_code = r.u8()?;
            let num_children = r.u8()? as usize;
            let num_macros = r.u8()? as usize;
            VtObject::Key {
                id,
                background_colour,
                key_code,
                children: r.children(num_children)?,
                macros: r.macros(num_macros)?,
            }
        }
        6 => {
            let width = r.u16()?;
            let height = r.u16()?;
            let background_colour = r.u8()?;
            let border_colour = r.u8()?;
            let key_code = r.u8()?;
            let options = r.u8()?;
            let num_children = r.u8()? as usize;
            let num_macros = r.u8()? as usize;
            VtObject::Button {
                id,
                width,
                height,
                background_colour,
                border_colour,
                key_code,
                options,
                children: r.children(num_children)?,
                macros: r.macros(num_macros)?,
            }
        }
        7 => {
            let background_colour = r.u8()?;
            let width = r.u16()?;
            let foreground_colour = r.u16()?;
            let variable_reference = r.u16()?;
            let value = r.bool()?;
            let enabled = r.bool()?;
            let num_macros = r.u8()? as usize;
            VtObject::InputBoolean {
                id,
                background_colour,
                width,
                foreground_colour,
                variable_reference,
                value,
                enabled,
                macros: r.macros(num_macros)?,
            }
        }
        8 => {
            let width = r.u16()?;
            let height = r.u16()?;
            let background_colour = r.u8()?;
            let font_attributes = r.u16()?;
            let input_attributes = r.u16()?;
            let options = r.u8()?;
            let variable_reference = r.u16()?;
            let justification = r.u8()?;
            let length = r.u8()? as usize;
            let value = r.take(length)?.to_vec();
            let enabled = r.bool()?;
            let num_macros = r.u8()? as usize;
            VtObject::InputString {
                id,
                width,
                height,
                background_colour,
                font_attributes,
                input_attributes,
                options,
                variable_reference,
                justification,
                value,
                enabled,
                macros: r.macros(num_macros)?,
            }
        }
        9 => {
            let width = r.u16()?;
            let height = r.u16()?;
            let background_colour = r.u8()?;
            let font_attributes = r.u16()?;
            let options = r.u8()?;
            let variable_reference = r.u16()?;
            let value = r.u32()?;
            let min_value = r.u32()?;
            let max_value = r.u32()?;
            let offset = r.i32()?;
            let scale = r.f32()?;
            let number_of_decimals = r.u8()?;
            let format = r.u8()?;
            if format > 1 {
                eyre::bail!("Input number format {format} out of range 0..=1");
            }
            let justification = r.u8()?;
            let options2 = r.u8()?;
            let num_macros = r.u8()? as usize;
            VtObject::InputNumber {
                id,
                width,
                height,
                background_colour,
                font_attributes,
                options,
                variable_reference,
                value,
                min_value,
                max_value,
                offset,
                scale,
                number_of_decimals,
                format,
                justification,
                options2,
                macros: r.macros(num_macros)?,
            }
        }
        11 => {
            let width = r.u16()?;
            let height = r.u16()?;
            let background_colour = r.u8()?;
            let font_attributes = r.u16()?;
            let options = r.u8()?;
            let variable_reference = r.u16()?;
            let justification = r.u8()?;
            let length = r.u16()? as usize;
            let value = r.take(length)?.to_vec();
            let num_macros = r.u8()? as usize;
            VtObject::OutputString {
                id,
                width,
                height,
                background_colour,
                font_attributes,
                options,
                variable_reference,
                justification,
                value,
                macros: r.macros(num_macros)?,
            }
        }
        12 => {
            let width = r.u16()?;
            let height = r.u16()?;
            let background_colour = r.u8()?;
            let font_attributes = r.u16()?;
            let options = r.u8()?;
            let variable_reference = r.u16()?;
            let value = r.u32()?;
            let offset = r.i32()?;
            let scale = r.f32()?;
            let number_of_decimals = r.u8()?;
            let format = r.u8()?;
            if format > 1 {
                eyre::bail!("Output number format {format} out of range 0..=1");
            }
            let justification = r.u8()?;
            let num_macros = r.u8()? as usize;
            VtObject::OutputNumber {
                id,
                width,
                height,
                background_colour,
                font_attributes,
                options,
                variable_reference,
                value,
                offset,
                scale,
                number_of_decimals,
                format,
                justification,
                macros: r.macros(num_macros)?,
            }
        }
        13 => {
            let line_attributes = r.u16()?;
            let width = r.u16()?;
            let height = r.u16()?;
            let line_direction = r.u8()?;
            if line_direction > 1 {
                eyre::bail!("Line direction {line_direction} out of range 0..=1");
            }
            let num_macros = r.u8()? as usize;
            VtObject::OutputLine {
                id,
                line_attributes,
                width,
                height,
                line_direction,
                macros: r.macros(num_macros)?,
            }
        }
        14 => {
            let line_attributes = r.u16()?;
            let width = r.u16()?;
            let height = r.u16()?;
            let line_suppression = r.u8()?;
            let fill_attributes = r.u16()?;
            let num_macros = r.u8()? as usize;
            VtObject::OutputRectangle {
                id,
                line_attributes,
                width,
                height,
                line_suppression,
                fill_attributes,
                macros: r.macros(num_macros)?,
            }
        }
        21 => VtObject::NumberVariable {
            id,
            value: r.u32()?,
        },
        22 => {
            let length = r.u16()? as usize;
            VtObject::StringVariable {
                id,
                value: r.take(length)?.to_vec(),
            }
        }
        23 => {
            let font_colour = r.u8()?;
            let font_size = r.u8()?;
            if font_size > 14 {
                eyre::bail!("Font size {font_size} out of range 0..=14");
            }
            let font_type = r.u8()?;
            let font_style = r.u8()?;
            let num_macros = r.u8()? as usize;
            VtObject::FontAttributes {
                id,
                font_colour,
                font_size,
                font_type,
                font_style,
                macros: r.macros(num_macros)?,
            }
        }
        24 => {
            let line_colour = r.u8()?;
            let line_width = r.u8()?;
            let line_art = r.u16()?;
            let num_macros = r.u8()? as usize;
            VtObject::LineAttributes {
                id,
                line_colour,
                line_width,
                line_art,
                macros: r.macros(num_macros)?,
            }
        }
        25 => {
            let fill_type = r.u8()?;
            if fill_type > 3 {
                eyre::bail!("Fill type {fill_type} out of range 0..=3");
            }
            let fill_colour = r.u8()?;
            let fill_pattern = r.u16()?;
            let num_macros = r.u8()? as usize;
            VtObject::FillAttributes {
                id,
                fill_type,
                fill_colour,
                fill_pattern,
                macros: r.macros(num_macros)?,
            }
        }
        27 => VtObject::ObjectPointer {
            id,
            value: r.u16()?,
        },
        28 => {
            let length = r.u16()? as usize;
            VtObject::Macro {
                id,
                commands: r.take(length)?.to_vec(),
            }
        }
        unknown => eyre::bail!("Unknown object type {unknown} for object {id:#06X}"),
    };

    Ok((object, r.cursor))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// id(2) type(1) bg(1) selectable(1) active_mask(2) counts(3), one child, one language
    fn working_set_bytes(id: u16) -> Vec<u8> {
        let mut bytes = vec![];
        bytes.extend_from_slice(&id.to_le_bytes());
        bytes.push(0); // WorkingSet
        bytes.push(0x01); // background colour
        bytes.push(1); // selectable
        bytes.extend_from_slice(&0x1001u16.to_le_bytes()); // active mask
        bytes.push(1); // children
        bytes.push(0); // macros
        bytes.push(1); // languages
        bytes.extend_from_slice(&0x2000u16.to_le_bytes()); // child id
        bytes.extend_from_slice(&10i16.to_le_bytes()); // child x
        bytes.extend_from_slice(&(-5i16).to_le_bytes()); // child y
        bytes.extend_from_slice(b"en");
        bytes
    }

    fn number_variable_bytes(id: u16, value: u32) -> Vec<u8> {
        let mut bytes = vec![];
        bytes.extend_from_slice(&id.to_le_bytes());
        bytes.push(21); // NumberVariable
        bytes.extend_from_slice(&value.to_le_bytes());
        bytes
    }

    fn alarm_mask_bytes(id: u16, priority: u8) -> Vec<u8> {
        let mut bytes = vec![];
        bytes.extend_from_slice(&id.to_le_bytes());
        bytes.push(2); // AlarmMask
        bytes.push(0x0C); // background colour
        bytes.extend_from_slice(&0xFFFFu16.to_le_bytes()); // no soft key mask
        bytes.push(priority);
        bytes.push(2); // acoustic signal
        bytes.push(0); // children
        bytes.push(0); // macros
        bytes
    }

    #[test]
    fn test_parse_working_set() {
        let (object, consumed) = parse_iop_object(&working_set_bytes(0x1000)).unwrap();
        assert_eq!(consumed, working_set_bytes(0x1000).len());
        assert_eq!(
            object,
            VtObject::WorkingSet {
                id: 0x1000,
                background_colour: 0x01,
                selectable: true,
                active_mask: 0x1001,
                children: vec![ChildRef {
                    object_id: 0x2000,
                    x: 10,
                    y: -5
                }],
                macros: vec![],
                languages: vec![[b'e', b'n']],
            }
        );
    }

    #[test]
    fn test_parse_pool_of_objects() {
        let mut pool = working_set_bytes(0x1000);
        pool.extend(alarm_mask_bytes(0x1001, 1));
        pool.extend(number_variable_bytes(0x3000, 1234));

        let objects = parse_iop_into_objects(&pool).unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[0].id(), 0x1000);
        assert_eq!(objects[1].id(), 0x1001);
        assert_eq!(
            objects[2],
            VtObject::NumberVariable {
                id: 0x3000,
                value: 1234
            }
        );
    }

    #[test]
    fn test_unknown_object_type_fails() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&0x1000u16.to_le_bytes());
        bytes.push(200); // not a type
        assert!(parse_iop_into_objects(&bytes).is_err());
    }

    #[test]
    fn test_truncated_object_fails() {
        let mut pool = number_variable_bytes(0x3000, 1234);
        pool.truncate(pool.len() - 1);
        assert!(parse_iop_into_objects(&pool).is_err());
    }

    #[test]
    fn test_duplicate_object_id_fails() {
        let mut pool = number_variable_bytes(0x3000, 1);
        pool.extend(number_variable_bytes(0x3000, 2));
        assert!(parse_iop_into_objects(&pool).is_err());
    }

    #[test]
    fn test_out_of_range_attribute_fails() {
        // Alarm mask priority is 0..=2
        assert!(parse_iop_into_objects(&alarm_mask_bytes(0x1001, 3)).is_err());
    }

    #[test]
    fn test_trailing_garbage_fails() {
        let mut pool = number_variable_bytes(0x3000, 1);
        pool.push(0xAB); // half an object ID
        assert!(parse_iop_into_objects(&pool).is_err());
    }

    #[test]
    fn test_output_string_round_trip() {
        let mut bytes = vec![];
        bytes.extend_from_slice(&0x4000u16.to_le_bytes());
        bytes.push(11); // OutputString
        bytes.extend_from_slice(&120u16.to_le_bytes()); // width
        bytes.extend_from_slice(&20u16.to_le_bytes()); // height
        bytes.push(0x01); // background colour
        bytes.extend_from_slice(&0x5000u16.to_le_bytes()); // font attributes
        bytes.push(0); // options
        bytes.extend_from_slice(&0xFFFFu16.to_le_bytes()); // no variable
        bytes.push(0); // justification
        bytes.extend_from_slice(&5u16.to_le_bytes()); // length
        bytes.extend_from_slice(b"hello");
        bytes.push(0); // macros

        let (object, consumed) = parse_iop_object(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        match object {
            VtObject::OutputString { id, value, .. } => {
                assert_eq!(id, 0x4000);
                assert_eq!(value, b"hello");
            }
            other => panic!("Expected an output string, got {other:?}"),
        }
    }
}
