// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! JSON request and response bodies of the HTTP interface.
//!
//! Field names are fixed by existing web clients, so the wire structs mirror
//! them exactly. Each request type converts into a validated request with
//! parsed addresses and byte strings before anything touches a device.

use crate::parse_hex_bytes;
use crate::parse_hex_u8;
use crate::Error;
use crate::PageId;
use crate::PartType;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

/// Response to a device enumeration.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
pub struct DeviceList {
    pub num_devices: usize,
    pub devices: Vec<String>,
}

impl DeviceList {
    pub fn new(devices: Vec<String>) -> Self {
        Self {
            num_devices: devices.len(),
            devices,
        }
    }
}

/// The outcome of a write request.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
pub struct StatusReport {
    pub success: bool,
    pub message: String,
    #[serde(rename = "extraData")]
    pub extra_data: String,
    pub milliseconds: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct AddressFields {
    pub rw_address: String,
    pub rw_start: String,
    pub rw_end: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub cur_byte_string: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct DeviceFields {
    #[serde(default)]
    pub device_name: Option<String>,
    pub device_index: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ReadWriteFields {
    /// Settling delay between transactions, in milliseconds.
    #[serde(default)]
    pub rw_delay: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase", default)]
pub struct PasswordFields {
    pub pass_enabled: bool,
    pub pass_address: String,
    pub pass_index: String,
    pub pass_key: String,
}

/// A request to write part of a page.
///
/// The client sends the whole page as it currently stands, and the byte range
/// `rwStart..=rwEnd` of it is written.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[serde(rename_all = "PascalCase")]
pub struct WriteFields {
    pub address_fields: AddressFields,
    pub page_info: PageInfo,
    pub device_fields: DeviceFields,
    #[serde(default)]
    pub read_write_fields: ReadWriteFields,
    #[serde(default)]
    pub password_fields: PasswordFields,
}

/// Which device a request is aimed at.
///
/// Without a name, the first adapter of the active family is assumed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceSelector {
    pub name: Option<String>,
    pub index: u32,
}

/// An unlock write issued ahead of the data write.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Password {
    pub table: u8,
    pub offset: u8,
    pub key: Vec<u8>,
}

/// A validated [`WriteFields`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteRequest {
    pub device: DeviceSelector,
    pub table: u8,
    pub offset: u8,
    pub data: Vec<u8>,
    pub delay: Option<Duration>,
    pub password: Option<Password>,
}

impl TryFrom<&WriteFields> for WriteRequest {
    type Error = Error;

    fn try_from(fields: &WriteFields) -> Result<Self, Self::Error> {
        let table = parse_hex_u8("rwAddress", &fields.address_fields.rw_address)?;
        let start = parse_hex_u8("rwStart", &fields.address_fields.rw_start)?;
        let end = parse_hex_u8("rwEnd", &fields.address_fields.rw_end)?;
        let page = parse_hex_bytes("curByteString", &fields.page_info.cur_byte_string)?;
        if end < start || usize::from(end) >= page.len() {
            return Err(Error::InvalidByteRange {
                start,
                end,
                len: page.len(),
            });
        }
        let data = page[usize::from(start)..=usize::from(end)].to_vec();

        let pass = &fields.password_fields;
        let password = if pass.pass_enabled {
            Some(Password {
                table: parse_hex_u8("passAddress", &pass.pass_address)?,
                offset: parse_hex_u8("passIndex", &pass.pass_index)?,
                key: parse_hex_bytes("passKey", &pass.pass_key)?,
            })
        } else {
            None
        };

        Ok(Self {
            device: DeviceSelector {
                name: fields.device_fields.device_name.clone(),
                index: fields.device_fields.device_index,
            },
            table,
            offset: start,
            data,
            delay: fields
                .read_write_fields
                .rw_delay
                .map(Duration::from_millis),
            password,
        })
    }
}

/// A request to read one or more whole pages.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ReadFields {
    pub device_index: u32,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub part_type: Option<String>,
    /// Bytes per bus transaction.
    #[serde(default)]
    pub chunk_size: Option<u16>,
    /// Settling delay between transactions, in milliseconds.
    #[serde(default)]
    pub rw_delay: Option<u64>,
    pub pages: Vec<String>,
}

/// A validated [`ReadFields`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadRequest {
    pub device: DeviceSelector,
    pub part: PartType,
    pub chunk_size: Option<u16>,
    pub delay: Option<Duration>,
    pub pages: Vec<PageId>,
}

impl TryFrom<&ReadFields> for ReadRequest {
    type Error = Error;

    fn try_from(fields: &ReadFields) -> Result<Self, Self::Error> {
        let part = match &fields.part_type {
            Some(tag) => tag.parse()?,
            None => PartType::default(),
        };
        let pages = fields
            .pages
            .iter()
            .map(|p| p.parse())
            .collect::<Result<Vec<PageId>, _>>()?;
        Ok(Self {
            device: DeviceSelector {
                name: fields.device_name.clone(),
                index: fields.device_index,
            },
            part,
            chunk_size: fields.chunk_size,
            delay: fields.rw_delay.map(Duration::from_millis),
            pages,
        })
    }
}

/// The contents of one page, as uppercase hex.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct PageData {
    pub page_name: String,
    pub page_hex: String,
}

/// The outcome of a read request.
///
/// Pages read before a failure are still returned.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ReadReport {
    pub pages: Vec<PageData>,
    pub success: bool,
    pub device_status: String,
    pub milliseconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_fields(start: &str, end: &str) -> WriteFields {
        serde_json::from_value(json!({
            "AddressFields": { "rwAddress": "A2", "rwStart": start, "rwEnd": end },
            "PageInfo": { "curByteString": "00112233445566778899" },
            "DeviceFields": { "deviceIndex": 1 },
            "ReadWriteFields": { "rwDelay": 10 },
            "PasswordFields": {
                "passEnabled": true,
                "passAddress": "A2",
                "passIndex": "7B",
                "passKey": "DEADBEEF"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_write_request_slices_page() {
        let request = WriteRequest::try_from(&write_fields("02", "04")).unwrap();
        assert_eq!(request.table, 0xA2);
        assert_eq!(request.offset, 2);
        assert_eq!(request.data, vec![0x22, 0x33, 0x44]);
        assert_eq!(request.delay, Some(Duration::from_millis(10)));
        assert_eq!(
            request.device,
            DeviceSelector {
                name: None,
                index: 1
            }
        );
        assert_eq!(
            request.password,
            Some(Password {
                table: 0xA2,
                offset: 0x7B,
                key: vec![0xDE, 0xAD, 0xBE, 0xEF],
            })
        );
    }

    #[test]
    fn test_write_request_rejects_bad_range() {
        assert!(matches!(
            WriteRequest::try_from(&write_fields("04", "02")),
            Err(Error::InvalidByteRange { .. })
        ));
        assert!(matches!(
            WriteRequest::try_from(&write_fields("00", "0A")),
            Err(Error::InvalidByteRange { len: 10, .. })
        ));
    }

    #[test]
    fn test_write_fields_optional_sections() {
        let fields: WriteFields = serde_json::from_value(json!({
            "AddressFields": { "rwAddress": "A0", "rwStart": "00", "rwEnd": "00" },
            "PageInfo": { "curByteString": "03" },
            "DeviceFields": { "deviceName": "CP2112", "deviceIndex": 0 }
        }))
        .unwrap();
        let request = WriteRequest::try_from(&fields).unwrap();
        assert!(request.password.is_none());
        assert!(request.delay.is_none());
        assert_eq!(request.device.name.as_deref(), Some("CP2112"));
    }

    #[test]
    fn test_read_request_parses_pages() {
        let fields: ReadFields = serde_json::from_value(json!({
            "deviceIndex": 0,
            "partType": "QSFP28",
            "chunkSize": 32,
            "rwDelay": 5,
            "pages": ["A0", "A0_3T"]
        }))
        .unwrap();
        let request = ReadRequest::try_from(&fields).unwrap();
        assert_eq!(request.part, PartType::Qsfp);
        assert_eq!(request.chunk_size, Some(32));
        assert_eq!(
            request.pages,
            vec![PageId::new(0xA0), PageId::with_table(0xA0, 3)]
        );
    }

    #[cfg(feature = "api-traits")]
    #[test]
    fn test_write_fields_schema() {
        let schema = schemars::schema_for!(WriteFields);
        let value = serde_json::to_value(&schema).unwrap();
        assert!(value["properties"].get("AddressFields").is_some());
        assert!(value["properties"].get("PasswordFields").is_some());
    }

    #[test]
    fn test_report_wire_names() {
        let report = StatusReport {
            success: true,
            message: "Success".to_string(),
            extra_data: String::new(),
            milliseconds: 12,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["extraData"], "");
        assert_eq!(value["milliseconds"], 12);

        let value = serde_json::to_value(DeviceList::new(vec!["CP2112 0".into()])).unwrap();
        assert_eq!(value, json!({ "num_devices": 1, "devices": ["CP2112 0"] }));

        let value = serde_json::to_value(ReadReport {
            pages: vec![PageData {
                page_name: "A0".into(),
                page_hex: "00".into(),
            }],
            success: true,
            device_status: "Success".into(),
            milliseconds: 0,
        })
        .unwrap();
        assert_eq!(value["pages"][0]["pageName"], "A0");
        assert_eq!(value["deviceStatus"], "Success");
    }
}
