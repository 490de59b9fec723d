//! Editor for compiled `AndroidManifest.xml` documents.
//!
//! Attribute names are looked up by local name. Framework attributes are
//! identified by the resource id the resource map assigns to their name string,
//! so creating one means inserting its name into the mapped head of the string
//! pool and shifting every string reference behind it.

use super::res::{
    Chunk, ResValue, ResValueType, ResXmlAttribute, StringPool,
};
use anyhow::{Context, Result};

pub const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";

/// Framework attribute resource ids.
pub mod attr {
    pub const LABEL: u32 = 0x0101_0001;
    pub const NAME: u32 = 0x0101_0003;
    pub const DEBUGGABLE: u32 = 0x0101_000f;
    pub const AUTHORITIES: u32 = 0x0101_0018;
    pub const MIN_SDK_VERSION: u32 = 0x0101_020c;
    pub const VERSION_CODE: u32 = 0x0101_021b;
    pub const VERSION_NAME: u32 = 0x0101_021c;
    pub const TARGET_SDK_VERSION: u32 = 0x0101_0270;
    pub const TEST_ONLY: u32 = 0x0101_0272;
    pub const EXTRACT_NATIVE_LIBS: u32 = 0x0101_04ea;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttrValue {
    String(String),
    Bool(bool),
    Int(u32),
    Reference(u32),
    Other(ResValue),
}

/// What a write did to the attribute it targeted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttrWrite {
    Updated,
    Created,
    Unchanged,
}

/// Handle to a start element, valid until the node list is restructured.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ElementId(usize);

#[derive(Clone, Debug)]
pub struct BinaryManifest {
    pool: StringPool,
    resource_map: Vec<u32>,
    nodes: Vec<Chunk>,
}

impl BinaryManifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let Chunk::Xml(chunks) = Chunk::from_bytes(bytes).context("While parsing binary xml")?
        else {
            anyhow::bail!("manifest is not a binary xml document");
        };
        let mut pool = None;
        let mut resource_map = vec![];
        let mut nodes = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match chunk {
                Chunk::StringPool(p) if pool.is_none() => pool = Some(p),
                Chunk::XmlResourceMap(map) => resource_map = map,
                chunk => nodes.push(chunk),
            }
        }
        let pool = pool.context("binary xml has no string pool")?;
        Ok(Self {
            pool,
            resource_map,
            nodes,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut chunks = Vec::with_capacity(self.nodes.len() + 2);
        chunks.push(Chunk::StringPool(self.pool.clone()));
        if !self.resource_map.is_empty() {
            chunks.push(Chunk::XmlResourceMap(self.resource_map.clone()));
        }
        chunks.extend(self.nodes.iter().cloned());
        Chunk::Xml(chunks).to_bytes()
    }

    pub fn strings(&self) -> &StringPool {
        &self.pool
    }

    /// Start elements in document order with their nesting depth (root is 0).
    pub fn elements(&self) -> Vec<(ElementId, usize)> {
        let mut depth = 0usize;
        let mut elements = vec![];
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                Chunk::XmlStartElement(..) => {
                    elements.push((ElementId(i), depth));
                    depth += 1;
                }
                Chunk::XmlEndElement(..) => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        elements
    }

    pub fn root(&self) -> Option<ElementId> {
        self.elements().first().map(|(id, _)| *id)
    }

    /// First `application` element directly under the root.
    pub fn application(&self) -> Option<ElementId> {
        self.elements()
            .into_iter()
            .find(|(id, depth)| *depth == 1 && self.element_name(*id) == Some("application"))
            .map(|(id, _)| id)
    }

    pub fn find_elements(&self, name: &str) -> Vec<ElementId> {
        self.elements()
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| self.element_name(*id) == Some(name))
            .collect()
    }

    pub fn element_name(&self, element: ElementId) -> Option<&str> {
        match self.nodes.get(element.0) {
            Some(Chunk::XmlStartElement(_, start, _)) => self.pool.get(start.name),
            _ => None,
        }
    }

    fn attributes(&self, element: ElementId) -> &[ResXmlAttribute] {
        match self.nodes.get(element.0) {
            Some(Chunk::XmlStartElement(_, _, attrs)) => attrs,
            _ => &[],
        }
    }

    fn attributes_mut(&mut self, element: ElementId) -> Result<&mut Vec<ResXmlAttribute>> {
        match self.nodes.get_mut(element.0) {
            Some(Chunk::XmlStartElement(_, _, attrs)) => Ok(attrs),
            _ => anyhow::bail!("node {} is not a start element", element.0),
        }
    }

    pub fn attribute_name(&self, element: ElementId, index: usize) -> Option<&str> {
        self.attributes(element)
            .get(index)
            .and_then(|attr| self.pool.get(attr.name))
    }

    /// Indices of the attributes whose local name is `local`, also accepting
    /// names that carry a prefix (`tools:label`).
    pub fn attributes_named(&self, element: ElementId, local: &str) -> Vec<usize> {
        let suffix = format!(":{local}");
        self.attributes(element)
            .iter()
            .enumerate()
            .filter(|(_, attr)| {
                self.pool
                    .get(attr.name)
                    .map(|name| name == local || name.ends_with(&suffix))
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn find_attribute(&self, element: ElementId, name: &str) -> Option<usize> {
        self.attributes(element)
            .iter()
            .position(|attr| self.pool.get(attr.name) == Some(name))
    }

    pub fn attribute_value(&self, element: ElementId, index: usize) -> Option<AttrValue> {
        let attr = self.attributes(element).get(index)?;
        let value = attr.typed_value;
        Some(match value.value_type() {
            Some(ResValueType::String) => {
                AttrValue::String(self.pool.get(value.data as i32)?.to_string())
            }
            Some(ResValueType::IntBoolean) => AttrValue::Bool(value.data != 0),
            Some(ResValueType::IntDec) | Some(ResValueType::IntHex) => AttrValue::Int(value.data),
            Some(ResValueType::Reference) => AttrValue::Reference(value.data),
            _ => match self.pool.get(attr.raw_value) {
                Some(raw) => AttrValue::String(raw.to_string()),
                None => AttrValue::Other(value),
            },
        })
    }

    pub fn get_string(&self, element: ElementId, name: &str) -> Option<String> {
        match self.attribute_value(element, self.find_attribute(element, name)?)? {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_bool(&self, element: ElementId, name: &str) -> Option<bool> {
        match self.attribute_value(element, self.find_attribute(element, name)?)? {
            AttrValue::Bool(b) => Some(b),
            AttrValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_int(&self, element: ElementId, name: &str) -> Option<u32> {
        match self.attribute_value(element, self.find_attribute(element, name)?)? {
            AttrValue::Int(v) => Some(v),
            AttrValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Rewrites the attribute at `index` as a literal string.
    pub fn set_string_at(&mut self, element: ElementId, index: usize, value: &str) -> Result<AttrWrite> {
        if self.attribute_value(element, index) == Some(AttrValue::String(value.to_string())) {
            return Ok(AttrWrite::Unchanged);
        }
        let string = self.ensure_string(value);
        let attr = self
            .attributes_mut(element)?
            .get_mut(index)
            .with_context(|| format!("attribute #{index} is out of range"))?;
        attr.raw_value = string as i32;
        attr.typed_value = ResValue::string(string);
        Ok(AttrWrite::Updated)
    }

    /// Sets an existing attribute to a string. Returns `None` if absent.
    pub fn set_string(&mut self, element: ElementId, name: &str, value: &str) -> Result<Option<AttrWrite>> {
        match self.find_attribute(element, name) {
            Some(index) => self.set_string_at(element, index, value).map(Some),
            None => Ok(None),
        }
    }

    /// Sets an existing attribute to a decimal integer. Returns `None` if absent.
    ///
    /// Negative values are stored as their two's complement bits.
    pub fn set_int(&mut self, element: ElementId, name: &str, value: i32) -> Result<Option<AttrWrite>> {
        let Some(index) = self.find_attribute(element, name) else {
            return Ok(None);
        };
        let attr = &mut self.attributes_mut(element)?[index];
        let typed = ResValue::int_dec(value as u32);
        if attr.typed_value == typed && attr.raw_value == -1 {
            return Ok(Some(AttrWrite::Unchanged));
        }
        attr.raw_value = -1;
        attr.typed_value = typed;
        Ok(Some(AttrWrite::Updated))
    }

    /// Sets `android:<name>` to a boolean, creating the attribute if missing.
    pub fn set_android_bool(
        &mut self,
        element: ElementId,
        name: &str,
        res_id: u32,
        value: bool,
    ) -> Result<AttrWrite> {
        let typed = ResValue::boolean(value);
        if let Some(index) = self.find_attribute(element, name) {
            let attr = &mut self.attributes_mut(element)?[index];
            if attr.typed_value == typed && attr.raw_value == -1 {
                return Ok(AttrWrite::Unchanged);
            }
            attr.raw_value = -1;
            attr.typed_value = typed;
            return Ok(AttrWrite::Updated);
        }
        let namespace = self.ensure_string(ANDROID_NS) as i32;
        let name = self.mapped_name(name, res_id) as i32;
        self.insert_attribute(
            element,
            ResXmlAttribute {
                namespace,
                name,
                raw_value: -1,
                typed_value: typed,
            },
        )?;
        Ok(AttrWrite::Created)
    }

    fn resource_id(&self, name: i32) -> Option<u32> {
        usize::try_from(name)
            .ok()
            .and_then(|i| self.resource_map.get(i))
            .copied()
    }

    /// Inserts `attr` keeping the element's attributes ordered by resource id,
    /// which is what the platform's attribute lookup expects.
    fn insert_attribute(&mut self, element: ElementId, attr: ResXmlAttribute) -> Result<()> {
        let id = self.resource_id(attr.name);
        let existing: Vec<Option<u32>> = self
            .attributes(element)
            .iter()
            .map(|a| self.resource_id(a.name))
            .collect();
        let pos = existing
            .iter()
            .position(|other| match (other, id) {
                (None, _) => true,
                (Some(other), Some(id)) => *other > id,
                (Some(_), None) => false,
            })
            .unwrap_or(existing.len());
        let Some(Chunk::XmlStartElement(_, start, attrs)) = self.nodes.get_mut(element.0) else {
            anyhow::bail!("node {} is not a start element", element.0);
        };
        attrs.insert(pos, attr);
        start.attribute_count = attrs.len() as u16;
        for index in [&mut start.id_index, &mut start.class_index, &mut start.style_index] {
            if *index > 0 && (*index as usize - 1) >= pos {
                *index += 1;
            }
        }
        Ok(())
    }

    fn ensure_string(&mut self, s: &str) -> usize {
        match self.pool.position(s) {
            Some(i) => i,
            None => {
                self.pool.strings.push(s.to_string());
                self.pool.strings.len() - 1
            }
        }
    }

    /// Index of a name string mapped to `res_id`, inserting one at the end of the
    /// mapped region if needed.
    fn mapped_name(&mut self, name: &str, res_id: u32) -> usize {
        if let Some(i) = self
            .resource_map
            .iter()
            .enumerate()
            .position(|(i, id)| *id == res_id && self.pool.get(i as i32) == Some(name))
        {
            return i;
        }
        let pos = self.resource_map.len().min(self.pool.strings.len());
        self.resource_map.truncate(pos);
        self.pool.strings.insert(pos, name.to_string());
        if pos < self.pool.styles.len() {
            self.pool.styles.insert(pos, vec![]);
        }
        self.resource_map.push(res_id);
        self.shift_strings_from(pos);
        pos
    }

    fn shift_strings_from(&mut self, pos: usize) {
        let pos = pos as i32;
        let shift = |idx: &mut i32| {
            if *idx >= pos {
                *idx += 1;
            }
        };
        let shift_value = |value: &mut ResValue| {
            if value.value_type() == Some(ResValueType::String) && value.data as i32 >= pos {
                value.data += 1;
            }
        };
        for style in self.pool.styles.iter_mut() {
            for span in style.iter_mut() {
                shift(&mut span.name);
            }
        }
        for node in self.nodes.iter_mut() {
            match node {
                Chunk::XmlStartNamespace(header, ns) | Chunk::XmlEndNamespace(header, ns) => {
                    shift(&mut header.comment);
                    shift(&mut ns.prefix);
                    shift(&mut ns.uri);
                }
                Chunk::XmlStartElement(header, start, attrs) => {
                    shift(&mut header.comment);
                    shift(&mut start.namespace);
                    shift(&mut start.name);
                    for attr in attrs.iter_mut() {
                        shift(&mut attr.namespace);
                        shift(&mut attr.name);
                        shift(&mut attr.raw_value);
                        shift_value(&mut attr.typed_value);
                    }
                }
                Chunk::XmlEndElement(header, end) => {
                    shift(&mut header.comment);
                    shift(&mut end.namespace);
                    shift(&mut end.name);
                }
                Chunk::XmlCdata(header, cdata) => {
                    shift(&mut header.comment);
                    shift(&mut cdata.data);
                    shift_value(&mut cdata.typed_value);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::res::{
        ResXmlEndElement, ResXmlNamespace, ResXmlNodeHeader, ResXmlStartElement,
    };

    // 0 label, 1 debuggable | 2 android, 3 ns, 4 manifest, 5 package, 6 application,
    // 7 com.old.app, 8 Old, 9 activity
    fn sample() -> Vec<u8> {
        let strings = [
            "label", "debuggable", "android", ANDROID_NS, "manifest", "package",
            "application", "com.old.app", "Old", "activity",
        ];
        let node = ResXmlNodeHeader::default();
        let ns = ResXmlNamespace { prefix: 2, uri: 3 };
        let element = |name: i32, attrs: Vec<ResXmlAttribute>| {
            Chunk::XmlStartElement(
                node,
                ResXmlStartElement {
                    name,
                    attribute_count: attrs.len() as u16,
                    ..Default::default()
                },
                attrs,
            )
        };
        let end = |name: i32| Chunk::XmlEndElement(node, ResXmlEndElement { namespace: -1, name });
        let label = ResXmlAttribute {
            namespace: 3,
            name: 0,
            raw_value: 8,
            typed_value: ResValue::string(8),
        };
        Chunk::Xml(vec![
            Chunk::StringPool(StringPool::new(strings.iter().map(|s| s.to_string()).collect(), true)),
            Chunk::XmlResourceMap(vec![attr::LABEL, attr::DEBUGGABLE]),
            Chunk::XmlStartNamespace(node, ns),
            element(
                4,
                vec![ResXmlAttribute {
                    namespace: -1,
                    name: 5,
                    raw_value: 7,
                    typed_value: ResValue::string(7),
                }],
            ),
            element(
                6,
                vec![
                    label,
                    ResXmlAttribute {
                        namespace: 3,
                        name: 1,
                        raw_value: -1,
                        typed_value: ResValue::boolean(true),
                    },
                ],
            ),
            element(9, vec![label]),
            end(9),
            end(6),
            end(4),
            Chunk::XmlEndNamespace(node, ns),
        ])
        .to_bytes()
        .unwrap()
    }

    #[test]
    fn should_locate_root_and_application() {
        let manifest = BinaryManifest::parse(&sample()).unwrap();
        let root = manifest.root().unwrap();
        assert_eq!(manifest.element_name(root), Some("manifest"));
        assert_eq!(manifest.get_string(root, "package").as_deref(), Some("com.old.app"));
        let app = manifest.application().unwrap();
        assert_eq!(manifest.get_bool(app, "debuggable"), Some(true));
        assert_eq!(manifest.find_elements("activity").len(), 1);
    }

    #[test]
    fn should_create_mapped_attribute_and_shift_references() {
        let mut manifest = BinaryManifest::parse(&sample()).unwrap();
        let app = manifest.application().unwrap();
        let write = manifest
            .set_android_bool(app, "testOnly", attr::TEST_ONLY, false)
            .unwrap();
        assert_eq!(write, AttrWrite::Created);

        let manifest = BinaryManifest::parse(&manifest.to_bytes().unwrap()).unwrap();
        let root = manifest.root().unwrap();
        let app = manifest.application().unwrap();
        assert_eq!(manifest.element_name(root), Some("manifest"));
        assert_eq!(manifest.get_string(root, "package").as_deref(), Some("com.old.app"));
        assert_eq!(manifest.get_bool(app, "testOnly"), Some(false));
        assert_eq!(manifest.get_string(app, "label").as_deref(), Some("Old"));
        // label < debuggable < testOnly
        assert_eq!(manifest.attribute_name(app, 0), Some("label"));
        assert_eq!(manifest.attribute_name(app, 2), Some("testOnly"));
        assert_eq!(manifest.strings().get(2), Some("testOnly"));
    }

    #[test]
    fn should_report_unchanged_writes() {
        let mut manifest = BinaryManifest::parse(&sample()).unwrap();
        let app = manifest.application().unwrap();
        assert_eq!(
            manifest
                .set_android_bool(app, "debuggable", attr::DEBUGGABLE, true)
                .unwrap(),
            AttrWrite::Unchanged
        );
        assert_eq!(
            manifest
                .set_android_bool(app, "debuggable", attr::DEBUGGABLE, false)
                .unwrap(),
            AttrWrite::Updated
        );
        let root = manifest.root().unwrap();
        assert_eq!(manifest.set_string(root, "versionName", "2.0").unwrap(), None);
    }

    #[test]
    fn should_rewrite_labels_on_every_element() {
        let mut manifest = BinaryManifest::parse(&sample()).unwrap();
        for (element, _) in manifest.elements() {
            for index in manifest.attributes_named(element, "label") {
                manifest.set_string_at(element, index, "Demo").unwrap();
            }
        }
        let manifest = BinaryManifest::parse(&manifest.to_bytes().unwrap()).unwrap();
        let activity = manifest.find_elements("activity")[0];
        assert_eq!(manifest.get_string(activity, "label").as_deref(), Some("Demo"));
    }
}
