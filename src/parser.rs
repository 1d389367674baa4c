//! ETW Types Parser
//!
//! This module walks the user data of an ETW event, locating each of its properties as described by
//! the event [`Schema`]. Because properties may have variable length (e.g. strings), the offset of
//! a property is only known once every property before it has been located: the walk is sequential,
//! and a walk that could not size a property cannot go any further.
use std::ops::Range;

use crate::native::etw_types::EventRecord;
use crate::native::tdh::{PropertyDataDescriptor, TdhBackend, TdhNativeError};
use crate::native::tdh_types::{Property, PropertyCount, PropertyKind, PropertyLength, TdhInType, TdhOutType};
use crate::property::DecodedProperty;
use crate::schema::{Schema, SchemaError};

/// Parser module errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserError {
    /// The length of a property could not be determined
    ///
    /// `source` is `None` when the property has no length and its type does not tell one either.
    UnresolvableLength {
        property: String,
        source: Option<TdhNativeError>,
    },
    /// The element count of an array could not be read from the property holding it
    UnresolvableCount {
        property: String,
        source: Option<TdhNativeError>,
    },
    /// TDH could not tell how many bytes a property occupies
    UnresolvableSize {
        property: String,
        source: TdhNativeError,
    },
    /// A property would end past the user data
    OutOfBounds {
        property: String,
        offset: usize,
        size: usize,
        user_data_len: usize,
    },
    /// The schema refers to a property it does not contain
    Schema(SchemaError),
}

impl std::fmt::Display for ParserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnresolvableLength { property, source: Some(e) } => {
                write!(f, "failed to get the length of {}: {}", property, e)
            }
            Self::UnresolvableLength { property, source: None } => {
                write!(f, "unexpected length of 0 for {}", property)
            }
            Self::UnresolvableCount { property, source: Some(e) } => {
                write!(f, "failed to get the element count of {}: {}", property, e)
            }
            Self::UnresolvableCount { property, source: None } => {
                write!(f, "invalid count property for {}", property)
            }
            Self::UnresolvableSize { property, source } => {
                write!(f, "failed to get the size of {}: {}", property, source)
            }
            Self::OutOfBounds {
                property,
                offset,
                size,
                user_data_len,
            } => write!(
                f,
                "{} ({} bytes at offset {}) overruns the user data ({} bytes)",
                property, size, offset, user_data_len
            ),
            Self::Schema(e) => write!(f, "schema error: {}", e),
        }
    }
}

impl std::error::Error for ParserError {}

impl From<SchemaError> for ParserError {
    fn from(err: SchemaError) -> Self {
        ParserError::Schema(err)
    }
}

pub type ParserResult<T> = Result<T, ParserError>;

/// The members of one element of a structure, in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructureInstance {
    members: Vec<DecodedProperty>,
}

impl StructureInstance {
    pub fn get(&self, name: &str) -> Option<&DecodedProperty> {
        self.members.iter().find(|m| m.name() == name)
    }

    pub fn members(&self) -> &[DecodedProperty] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Every property located by a [`PropertyWalker`]
///
/// When the walk was aborted, the table holds the properties located before the failure, which
/// should not be trusted blindly. Check [`PropertyTable::is_aborted`] first.
#[derive(Debug, Clone, Default)]
pub struct PropertyTable {
    scalars: Vec<DecodedProperty>,
    arrays: Vec<(String, Vec<DecodedProperty>)>,
    structures: Vec<StructureInstance>,
    consumed: usize,
    error: Option<ParserError>,
}

impl PropertyTable {
    pub fn scalar(&self, name: &str) -> Option<&DecodedProperty> {
        self.scalars.iter().find(|p| p.name() == name)
    }

    pub(crate) fn scalar_mut(&mut self, name: &str) -> Option<&mut DecodedProperty> {
        self.scalars.iter_mut().find(|p| p.name() == name)
    }

    pub(crate) fn push_scalar(&mut self, property: DecodedProperty) {
        self.scalars.push(property);
    }

    pub fn scalars(&self) -> &[DecodedProperty] {
        &self.scalars
    }

    pub fn array(&self, name: &str) -> Option<&[DecodedProperty]> {
        self.arrays
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, elements)| elements.as_slice())
    }

    pub fn arrays(&self) -> impl Iterator<Item = (&str, &[DecodedProperty])> {
        self.arrays.iter().map(|(n, e)| (n.as_str(), e.as_slice()))
    }

    pub fn structures(&self) -> &[StructureInstance] {
        &self.structures
    }

    /// Names of the scalars, then of the arrays, in declaration order
    pub fn names(&self) -> Vec<&str> {
        self.scalars
            .iter()
            .map(|p| p.name())
            .chain(self.arrays.iter().map(|(n, _)| n.as_str()))
            .collect()
    }

    /// User data bytes the walk went through
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn is_aborted(&self) -> bool {
        self.error.is_some()
    }

    /// What aborted the walk, if it was aborted
    pub fn error(&self) -> Option<&ParserError> {
        self.error.as_ref()
    }
}

/// The structure element a member belongs to
struct Scope<'s> {
    name: &'s str,
    index: u32,
    members: Range<u16>,
}

/// Walks the user data of a record
///
/// # Example
/// ```
/// # use etwdecode::native::etw_types::{EventDescriptor, EventHeader, Guid, OwnedEventRecord};
/// # use etwdecode::native::memory::{MemoryTdh, PropertyDef, SchemaBuilder};
/// # use etwdecode::native::tdh_types::{TdhInType, TdhOutType};
/// # use etwdecode::parser::PropertyWalker;
/// # use etwdecode::schema::Schema;
/// let provider = Guid::from_values(1, 2, 3, [4; 8]);
/// let tdh = MemoryTdh::new().with_schema(
///     SchemaBuilder::new(provider, EventDescriptor::default())
///         .property(PropertyDef::value("Pid", TdhInType::InTypeUInt32, TdhOutType::OutTypeNull)),
/// );
/// let mut header = EventHeader::default();
/// header.provider_id = provider;
/// let record = OwnedEventRecord::new(header, 1234u32.to_le_bytes().to_vec());
///
/// let schema = Schema::from_record(&tdh, &record).unwrap();
/// let table = PropertyWalker::new(&tdh, &record, &schema).walk();
/// assert!(!table.is_aborted());
/// assert_eq!(table.scalar("Pid").unwrap().size(), 4);
/// assert_eq!(table.consumed(), 4);
/// ```
pub struct PropertyWalker<'a> {
    backend: &'a dyn TdhBackend,
    record: &'a EventRecord,
    schema: &'a Schema,
}

impl<'a> PropertyWalker<'a> {
    pub fn new(backend: &'a dyn TdhBackend, record: &'a EventRecord, schema: &'a Schema) -> Self {
        Self {
            backend,
            record,
            schema,
        }
    }

    /// Locates every top-level property, in declaration order
    pub fn walk(&self) -> PropertyTable {
        let mut table = PropertyTable::default();
        let mut cursor = 0;

        for i in 0..self.schema.top_level_property_count() {
            if let Err(e) = self.walk_top_level(i, &mut table, &mut cursor) {
                table.error = Some(e);
                break;
            }
        }

        table.consumed = cursor;
        table
    }

    fn walk_top_level(&self, index: u32, table: &mut PropertyTable, cursor: &mut usize) -> ParserResult<()> {
        let property = self.schema.property(index)?;
        let count = self.array_count(property)?;

        match property.kind {
            PropertyKind::Struct {
                start_index,
                member_count,
            } => {
                let members = start_index..start_index.saturating_add(member_count);
                for k in 0..count {
                    let scope = Scope {
                        name: &property.name,
                        index: k,
                        members: members.clone(),
                    };
                    let instance = self.walk_structure(&scope, cursor)?;
                    table.structures.push(instance);
                }
            }
            PropertyKind::Value { .. } if property.is_array() => {
                let length = self.resolve_length(property, None)?;
                let mut elements = Vec::with_capacity(count as usize);
                for k in 0..count {
                    let path = [PropertyDataDescriptor::new(&property.name, k)];
                    elements.push(self.locate(property, length, &path, cursor)?);
                }
                if !elements.is_empty() {
                    table.arrays.push((property.name.clone(), elements));
                }
            }
            PropertyKind::Value { .. } => {
                if count > 0 {
                    let length = self.resolve_length(property, None)?;
                    let path = [PropertyDataDescriptor::whole(&property.name)];
                    table.scalars.push(self.locate(property, length, &path, cursor)?);
                }
            }
        }

        Ok(())
    }

    fn walk_structure(&self, scope: &Scope<'_>, cursor: &mut usize) -> ParserResult<StructureInstance> {
        let mut instance = StructureInstance::default();

        for j in scope.members.clone() {
            let member = self.schema.property(j as u32)?;
            let length = self.resolve_length(member, Some(scope))?;
            let path = [
                PropertyDataDescriptor::new(scope.name, scope.index),
                PropertyDataDescriptor::whole(&member.name),
            ];
            instance.members.push(self.locate(member, length, &path, cursor)?);
        }

        Ok(instance)
    }

    /// Asks TDH for the size of the property at `path`, and moves the cursor past it
    fn locate(
        &self,
        property: &Property,
        length: u32,
        path: &[PropertyDataDescriptor<'_>],
        cursor: &mut usize,
    ) -> ParserResult<DecodedProperty> {
        let size = self
            .backend
            .property_size(self.record, path)
            .map_err(|source| ParserError::UnresolvableSize {
                property: property.name.clone(),
                source,
            })? as usize;

        let user_data_len = self.record.user_buffer().len();
        let remaining = user_data_len.saturating_sub(*cursor);
        if size > remaining {
            return Err(ParserError::OutOfBounds {
                property: property.name.clone(),
                offset: *cursor,
                size,
                user_data_len,
            });
        }

        let decoded = DecodedProperty::new(
            property.name.clone(),
            length,
            *cursor,
            size,
            remaining,
            property.raw_in_type(),
            property.raw_out_type(),
            property.map_name.clone(),
        );
        *cursor += size;
        Ok(decoded)
    }

    /// The length TDH should be given to format this property
    fn resolve_length(&self, property: &Property, scope: Option<&Scope<'_>>) -> ParserResult<u32> {
        let length = match property.length {
            PropertyLength::Index(j) => {
                return self.referenced_value(j, scope).map_err(|source| {
                    ParserError::UnresolvableLength {
                        property: property.name.clone(),
                        source,
                    }
                })
            }
            PropertyLength::Length(l) => l as u32,
        };

        if length > 0 || property.is_struct() {
            return Ok(length);
        }

        match (property.in_type(), property.out_type()) {
            // sizeof(IN6_ADDR)
            (TdhInType::InTypeBinary, TdhOutType::OutTypeIpv6) => Ok(16),
            // Formatting stops at the terminator or at the end of the data
            (TdhInType::InTypeUnicodeString, _)
            | (TdhInType::InTypeAnsiString, _)
            | (TdhInType::InTypeSid, _)
            | (TdhInType::InTypeWbemSid, _) => Ok(length),
            _ => Err(ParserError::UnresolvableLength {
                property: property.name.clone(),
                source: None,
            }),
        }
    }

    fn array_count(&self, property: &Property) -> ParserResult<u32> {
        match property.count {
            PropertyCount::Count(c) => Ok(c as u32),
            PropertyCount::Index(j) => {
                self.referenced_value(j, None)
                    .map_err(|source| ParserError::UnresolvableCount {
                        property: property.name.clone(),
                        source,
                    })
            }
        }
    }

    /// Reads the integer held by the property at `index`
    ///
    /// The referenced property is a sibling member when it is part of the same structure,
    /// a top-level property otherwise.
    fn referenced_value(&self, index: u16, scope: Option<&Scope<'_>>) -> Result<u32, Option<TdhNativeError>> {
        let referenced = self.schema.property(index as u32).map_err(|_| None)?;

        let whole = PropertyDataDescriptor::whole(&referenced.name);
        let path: Vec<PropertyDataDescriptor<'_>> = match scope {
            Some(s) if s.members.contains(&index) => {
                vec![PropertyDataDescriptor::new(s.name, s.index), whole]
            }
            _ => vec![whole],
        };

        let size = self.backend.property_size(self.record, &path).map_err(Some)?;
        let mut buffer = vec![0u8; size as usize];
        self.backend
            .property(self.record, &path, &mut buffer)
            .map_err(Some)?;

        Ok(buffer
            .iter()
            .take(4)
            .rev()
            .fold(0u32, |acc, b| (acc << 8) | *b as u32))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::etw_types::{EventDescriptor, EventHeader, Guid, OwnedEventRecord};
    use crate::native::memory::{MemoryTdh, PropertyDef, SchemaBuilder};

    const PROVIDER: Guid = Guid::from_values(0x3333, 0, 0, [2; 8]);

    fn record(user_data: Vec<u8>) -> OwnedEventRecord {
        let mut header = EventHeader::default();
        header.provider_id = PROVIDER;
        OwnedEventRecord::new(header, user_data)
    }

    fn walk(builder: SchemaBuilder, user_data: Vec<u8>) -> PropertyTable {
        let tdh = MemoryTdh::new().with_schema(builder);
        let record = record(user_data);
        let schema = Schema::from_record(&tdh, &record).unwrap();
        PropertyWalker::new(&tdh, &record, &schema).walk()
    }

    fn builder() -> SchemaBuilder {
        SchemaBuilder::new(PROVIDER, EventDescriptor::default())
    }

    fn utf16z(s: &str) -> Vec<u8> {
        s.encode_utf16()
            .chain(std::iter::once(0))
            .flat_map(|u| u.to_le_bytes())
            .collect()
    }

    #[test]
    fn test_dynamic_length() {
        let mut data = utf16z("abc");
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let len = data.len();

        let table = walk(
            builder()
                .property(PropertyDef::value("Name", TdhInType::InTypeUnicodeString, TdhOutType::OutTypeNull))
                .property(PropertyDef::value("DataLength", TdhInType::InTypeUInt32, TdhOutType::OutTypeNull))
                .property(
                    PropertyDef::value("Data", TdhInType::InTypeBinary, TdhOutType::OutTypeHexBinary)
                        .with_length_from(1),
                ),
            data,
        );

        assert!(!table.is_aborted());
        assert_eq!(table.names(), vec!["Name", "DataLength", "Data"]);
        let name = table.scalar("Name").unwrap();
        assert_eq!((name.offset(), name.size(), name.length()), (0, 8, 0));
        let payload = table.scalar("Data").unwrap();
        assert_eq!((payload.offset(), payload.size(), payload.length()), (12, 4, 4));
        assert_eq!(payload.remaining(), 4);
        assert_eq!(table.consumed(), len);
    }

    #[test]
    fn test_arrays_and_structures() {
        let mut data = vec![3u8, 0];
        data.extend_from_slice(&[10, 20, 30]);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&[1, b'a', 0]);
        data.extend_from_slice(&[2, b'b', b'c', 0]);
        let len = data.len();

        let table = walk(
            builder()
                .property(PropertyDef::value("Count", TdhInType::InTypeUInt16, TdhOutType::OutTypeNull))
                .property(
                    PropertyDef::value("Bytes", TdhInType::InTypeUInt8, TdhOutType::OutTypeNull).with_count_from(0),
                )
                .property(PropertyDef::value("Entries", TdhInType::InTypeUInt16, TdhOutType::OutTypeNull))
                .property(PropertyDef::structure("Entry", 4, 2).with_count_from(2))
                .property(PropertyDef::value("Key", TdhInType::InTypeUInt8, TdhOutType::OutTypeNull))
                .property(PropertyDef::value("Value", TdhInType::InTypeAnsiString, TdhOutType::OutTypeNull)),
            data,
        );

        assert!(!table.is_aborted(), "{:?}", table.error());
        let bytes = table.array("Bytes").unwrap();
        assert_eq!(bytes.len(), 3);
        assert_eq!(bytes[2].offset(), 4);

        let structures = table.structures();
        assert_eq!(structures.len(), 2);
        assert_eq!(structures[0].members().len(), 2);
        assert_eq!(structures[1].get("Value").unwrap().size(), 3);

        // cursor sum
        let total: usize = table.scalars().iter().map(|p| p.size()).sum::<usize>()
            + bytes.iter().map(|p| p.size()).sum::<usize>()
            + structures
                .iter()
                .flat_map(|s| s.members())
                .map(|p| p.size())
                .sum::<usize>();
        assert_eq!(total, len);
        assert_eq!(table.consumed(), len);
    }

    #[test]
    fn test_unresolvable_length_aborts() {
        let table = walk(
            builder()
                .property(PropertyDef::value("Pid", TdhInType::InTypeUInt32, TdhOutType::OutTypeNull))
                .property(PropertyDef::raw_value(
                    "Blob",
                    TdhInType::InTypeBinary as u16,
                    TdhOutType::OutTypeHexBinary as u16,
                    0,
                ))
                .property(PropertyDef::value("After", TdhInType::InTypeUInt32, TdhOutType::OutTypeNull)),
            vec![0; 12],
        );

        assert!(table.is_aborted());
        assert_eq!(
            table.error(),
            Some(&ParserError::UnresolvableLength {
                property: "Blob".to_owned(),
                source: None
            })
        );
        assert!(table.scalar("Pid").is_some());
        assert!(table.scalar("After").is_none());
        assert_eq!(table.consumed(), 4);
    }

    #[test]
    fn test_ipv6_length() {
        let table = walk(
            builder().property(PropertyDef::raw_value(
                "Address",
                TdhInType::InTypeBinary as u16,
                TdhOutType::OutTypeIpv6 as u16,
                0,
            )),
            vec![0; 16],
        );

        assert!(!table.is_aborted());
        assert_eq!(table.scalar("Address").unwrap().length(), 16);
        assert_eq!(table.consumed(), 16);
    }

    #[test]
    fn test_truncated_user_data() {
        let table = walk(
            builder()
                .property(PropertyDef::value("A", TdhInType::InTypeUInt32, TdhOutType::OutTypeNull))
                .property(PropertyDef::value("B", TdhInType::InTypeUInt64, TdhOutType::OutTypeNull)),
            vec![0; 6],
        );

        assert!(matches!(
            table.error(),
            Some(ParserError::UnresolvableSize { property, .. }) if property == "B"
        ));
        assert_eq!(table.consumed(), 4);
    }

    #[test]
    fn test_bad_count_reference() {
        let table = walk(
            builder().property(
                PropertyDef::value("Items", TdhInType::InTypeUInt8, TdhOutType::OutTypeNull).with_count_from(9),
            ),
            vec![0; 4],
        );

        assert_eq!(
            table.error(),
            Some(&ParserError::UnresolvableCount {
                property: "Items".to_owned(),
                source: None
            })
        );
    }
}
