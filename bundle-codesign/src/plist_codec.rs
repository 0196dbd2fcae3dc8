// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! XML property list encoding, decoding and merging.

Only the value types that appear in entitlements and `Info.plist` overrides
are supported: booleans, strings, integers, arrays and dictionaries. Anything
else (data, dates, reals, UIDs) is rejected on the way in and on the way out,
so a value that encodes successfully always decodes back to itself.
*/

use {
    crate::error::BundleCodesignError,
    plist::{Dictionary, Value},
    std::path::Path,
};

/// Ensure a [Value] only contains supported types.
fn ensure_supported(value: &Value) -> Result<(), BundleCodesignError> {
    match value {
        Value::Boolean(_) | Value::String(_) | Value::Integer(_) => Ok(()),
        Value::Array(array) => array.iter().try_for_each(ensure_supported),
        Value::Dictionary(dict) => dict.values().try_for_each(ensure_supported),
        Value::Data(_) => Err(BundleCodesignError::PlistUnsupportedValue("data")),
        Value::Date(_) => Err(BundleCodesignError::PlistUnsupportedValue("date")),
        Value::Real(_) => Err(BundleCodesignError::PlistUnsupportedValue("real")),
        Value::Uid(_) => Err(BundleCodesignError::PlistUnsupportedValue("uid")),
        _ => Err(BundleCodesignError::PlistUnsupportedValue("unknown")),
    }
}

/// Encode a value to XML property list text.
pub fn encode(value: &Value) -> Result<String, BundleCodesignError> {
    ensure_supported(value)?;

    let mut data = Vec::<u8>::new();
    value
        .to_writer_xml(&mut data)
        .map_err(BundleCodesignError::PlistSerializeXml)?;

    Ok(String::from_utf8(data)?)
}

/// Decode XML property list text.
pub fn decode(text: &str) -> Result<Value, BundleCodesignError> {
    let value = Value::from_reader_xml(std::io::Cursor::new(text.as_bytes()))
        .map_err(BundleCodesignError::PlistParseXml)?;

    ensure_supported(&value)?;

    Ok(value)
}

/// Decode XML property list text whose root must be a dictionary.
pub fn decode_dictionary(text: &str, origin: &Path) -> Result<Dictionary, BundleCodesignError> {
    decode(text)?
        .into_dictionary()
        .ok_or_else(|| BundleCodesignError::PlistNotDictionary(origin.to_path_buf()))
}

/// Read a plist file whose root is a dictionary.
///
/// Unlike [decode], any value type is accepted. This is meant for existing
/// `Info.plist` files, which routinely carry reals and dates we need to
/// preserve untouched.
pub fn read_dictionary_file(path: &Path) -> Result<Dictionary, BundleCodesignError> {
    let value = Value::from_file(path).map_err(BundleCodesignError::PlistParseXml)?;

    value
        .into_dictionary()
        .ok_or_else(|| BundleCodesignError::PlistNotDictionary(path.to_path_buf()))
}

/// Write a dictionary to a file in XML plist format.
pub fn write_dictionary_file(path: &Path, dict: &Dictionary) -> Result<(), BundleCodesignError> {
    Value::Dictionary(dict.clone())
        .to_file_xml(path)
        .map_err(BundleCodesignError::PlistSerializeXml)
}

/// Deep merge two dictionaries.
///
/// Keys of `overrides` win. When both sides hold a dictionary for the same
/// key, the dictionaries are merged recursively. Key order of `defaults` is
/// preserved and new keys are appended in `overrides` order.
pub fn merge(defaults: &Dictionary, overrides: &Dictionary) -> Dictionary {
    let mut merged = defaults.clone();

    for (key, value) in overrides {
        let new_value = match (merged.get(key), value) {
            (Some(Value::Dictionary(existing)), Value::Dictionary(incoming)) => {
                Value::Dictionary(merge(existing, incoming))
            }
            _ => value.clone(),
        };

        merged.insert(key.clone(), new_value);
    }

    merged
}
