//! Exports hive trees to JSON and compares them across write, reopen and
//! copy cycles.

use reg_hive::{HiveOptions, RegistryHive, RegistryKey, SubkeyListType, ValueData};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read, Seek, Write};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct ValueExport {
    name: String,
    value_type: String,
    data_hex: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct KeyExport {
    name: String,
    class_name: Option<String>,
    values: Vec<ValueExport>,
    subkeys: Vec<KeyExport>,
}

/// Recursively exports a key and everything below it.
fn export_key<S: Read + Write + Seek>(key: &mut RegistryKey<'_, S>) -> Result<KeyExport, Box<dyn std::error::Error>> {
    let values = key
        .values()?
        .iter()
        .map(|value| {
            Ok(ValueExport {
                name: value.name().to_string(),
                value_type: value.data_type().to_string(),
                data_hex: hex::encode(value.raw_data()?),
            })
        })
        .collect::<Result<Vec<_>, reg_hive::RegistryError>>()?;

    let mut subkeys = Vec::new();
    for name in key.subkey_names()? {
        let mut subkey = key
            .open_subkey(&name)?
            .ok_or_else(|| format!("Listed subkey {} cannot be opened", name))?;
        subkeys.push(export_key(&mut subkey)?);
    }

    Ok(KeyExport {
        name: key.local_name()?,
        class_name: key.class_name()?,
        values,
        subkeys,
    })
}

fn export_hive<S: Read + Write + Seek>(hive: &mut RegistryHive<S>) -> KeyExport {
    let mut root = hive.root_key().unwrap();
    export_key(&mut root).unwrap()
}

/// Builds a small tree resembling a software hive.
fn populate<S: Read + Write + Seek>(hive: &mut RegistryHive<S>) {
    let mut root = hive.root_key().unwrap();

    let mut vendor = root.create_subkey("Software\\Vendor\\Product").unwrap();
    vendor.set_value("", &ValueData::String("Product".into())).unwrap();
    vendor.set_value("Version", &ValueData::Dword(0x0001_0002)).unwrap();
    vendor.set_value("InstallPath", &ValueData::ExpandString("%ProgramFiles%\\Vendor".into())).unwrap();
    vendor.set_value("Features", &ValueData::MultiString(vec!["core".into(), "extras".into()])).unwrap();
    vendor.set_value("Blob", &ValueData::Binary((0u8..=255).collect())).unwrap();
    vendor.set_class_name(Some("VendorClass")).unwrap();

    let mut services = root.create_subkey("System\\Services").unwrap();
    for i in 0..40 {
        let mut service = services.create_subkey(&format!("Service{:02}", i)).unwrap();
        service.set_value("Start", &ValueData::Dword(i % 5)).unwrap();
        service.set_value("Id", &ValueData::Qword(u64::from(i) << 40)).unwrap();
    }
}

#[test]
fn test_export_survives_reopen() {
    let mut hive = RegistryHive::create(Cursor::new(Vec::new())).unwrap();
    populate(&mut hive);
    let before = export_hive(&mut hive);

    let mut reopened = RegistryHive::open(hive.into_inner()).unwrap();
    let after = export_hive(&mut reopened);
    assert_eq!(before, after);

    let services = &after.subkeys[1].subkeys[0];
    assert_eq!(services.name, "Services");
    assert_eq!(services.subkeys.len(), 40);
    assert_eq!(after.subkeys[0].subkeys[0].subkeys[0].class_name.as_deref(), Some("VendorClass"));
}

#[test]
fn test_list_types_export_identically() {
    let mut fast = RegistryHive::create(Cursor::new(Vec::new())).unwrap();
    populate(&mut fast);

    let options = HiveOptions::default().with_subkey_list_type(SubkeyListType::HashLeaf);
    let mut hashed = RegistryHive::create_with_options(Cursor::new(Vec::new()), options).unwrap();
    populate(&mut hashed);

    assert_eq!(export_hive(&mut fast), export_hive(&mut hashed));
}

#[test]
fn test_json_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let hive_path = dir.path().join("software.hiv");
    let json_path = dir.path().join("software.json");

    {
        let mut hive = RegistryHive::create_file(&hive_path).unwrap();
        populate(&mut hive);
        hive.flush().unwrap();
    }

    let mut hive = RegistryHive::open_file(&hive_path).unwrap();
    let export = export_hive(&mut hive);
    std::fs::write(&json_path, serde_json::to_string_pretty(&export).unwrap()).unwrap();

    let loaded: KeyExport = serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(loaded, export);

    let product = &loaded.subkeys[0].subkeys[0].subkeys[0];
    let version = product.values.iter().find(|v| v.name == "Version").unwrap();
    assert_eq!(version.value_type, "REG_DWORD");
    assert_eq!(version.data_hex, "02000100");
}

#[test]
fn test_deleted_branch_absent_from_export() {
    let mut hive = RegistryHive::create(Cursor::new(Vec::new())).unwrap();
    populate(&mut hive);
    {
        let mut root = hive.root_key().unwrap();
        root.delete_subkey_tree("System").unwrap();
    }

    let mut hive = RegistryHive::open(hive.into_inner()).unwrap();
    let export = export_hive(&mut hive);
    let names: Vec<&str> = export.subkeys.iter().map(|k| k.name.as_str()).collect();
    assert_eq!(names, vec!["Software"]);
}
