//! Integration tests over in-memory and on-disk hives.

use reg_hive::{
    HiveHeader, HiveOptions, KeyNode, RegistryError, RegistryHive, SecurityCell, SubkeyListType,
    ValueData, ValueType, NO_INDEX,
};
use std::io::Cursor;

type MemHive = RegistryHive<Cursor<Vec<u8>>>;

fn new_hive() -> MemHive {
    RegistryHive::create(Cursor::new(Vec::new())).expect("Failed to create hive")
}

fn reopen(hive: MemHive) -> MemHive {
    RegistryHive::open(hive.into_inner()).expect("Failed to reopen hive")
}

fn ring_indices(hive: &MemHive) -> Vec<i32> {
    hive.security_ring().unwrap().iter().map(|c| c.index).collect()
}

#[test]
fn test_fresh_root() {
    let mut hive = new_hive();
    let root = hive.root_key().unwrap();

    assert!(root.flags().unwrap().is_root());
    assert_eq!(root.subkey_count().unwrap(), 0);
    assert_eq!(root.value_count().unwrap(), 0);
    assert!(root.timestamp().unwrap().is_some());
    assert!(root.security_descriptor().unwrap().is_some());
}

#[test]
fn test_create_and_open_nested() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();

    let created = root.create_subkey("A\\B\\C").unwrap();
    assert_eq!(created.name().unwrap(), "A\\B\\C");

    let opened = root.open_subkey("A\\B\\C").unwrap().unwrap();
    assert_eq!(opened.name().unwrap(), "A\\B\\C");
    assert_eq!(opened.local_name().unwrap(), "C");

    assert!(root.open_subkey("A\\Z").unwrap().is_none());
    assert!(root.open_subkey("a\\b\\c").unwrap().is_some());

    let mut a = root.open_subkey("A").unwrap().unwrap();
    let b = a.open_subkey("B").unwrap().unwrap();
    assert_eq!(b.name().unwrap(), "A\\B");
}

#[test]
fn test_create_existing_returns_same_key() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();

    let first = root.create_subkey("Software").unwrap().index();
    let second = root.create_subkey("SOFTWARE").unwrap().index();
    assert_eq!(first, second);
    assert_eq!(root.subkey_count().unwrap(), 1);
}

#[test]
fn test_dword_value() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();

    root.set_value("Count", &ValueData::Dword(42)).unwrap();
    assert_eq!(root.get_value("Count").unwrap(), Some(ValueData::Dword(42)));
    assert_eq!(root.get_value_type("Count").unwrap(), Some(ValueType::Dword));
    assert_eq!(root.get_value("Missing").unwrap(), None);
}

#[test]
fn test_value_types_round_trip() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();
    let mut key = root.create_subkey("Values").unwrap();

    let samples = vec![
        ("sz", ValueData::String("hello".into())),
        ("expand", ValueData::ExpandString("%SystemRoot%\\x".into())),
        ("bin", ValueData::Binary(vec![0xDE, 0xAD, 0xBE, 0xEF, 0x01])),
        ("be", ValueData::DwordBigEndian(0x0102_0304)),
        ("multi", ValueData::MultiString(vec!["one".into(), "two".into()])),
        ("qword", ValueData::Qword(u64::MAX - 1)),
        ("none", ValueData::None),
    ];
    for (name, data) in &samples {
        key.set_value(name, data).unwrap();
    }

    let mut hive = reopen(hive);
    let mut root = hive.root_key().unwrap();
    let key = root.open_subkey("Values").unwrap().unwrap();
    for (name, data) in &samples {
        assert_eq!(key.get_value(name).unwrap().as_ref(), Some(data), "value {}", name);
    }
}

#[test]
fn test_overwrite_value_changes_type_and_size() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();

    root.set_value("v", &ValueData::Dword(1)).unwrap();
    root.set_value("v", &ValueData::String("a longer string value".into())).unwrap();
    assert_eq!(
        root.get_value("v").unwrap(),
        Some(ValueData::String("a longer string value".into()))
    );

    root.set_value("v", &ValueData::Binary(vec![9; 3])).unwrap();
    assert_eq!(root.get_value("v").unwrap(), Some(ValueData::Binary(vec![9; 3])));
    assert_eq!(root.value_count().unwrap(), 1);
}

#[test]
fn test_value_names_sorted_and_case_insensitive() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();

    for name in ["zeta", "Alpha", "beta", ""] {
        root.set_value(name, &ValueData::Dword(1)).unwrap();
    }
    assert_eq!(root.value_names().unwrap(), vec!["", "Alpha", "beta", "zeta"]);

    assert!(root.value("ALPHA").unwrap().is_some());
    root.delete_value("BETA", true).unwrap();
    assert_eq!(root.value_names().unwrap(), vec!["", "Alpha", "zeta"]);

    assert!(matches!(
        root.delete_value("beta", true).unwrap_err(),
        RegistryError::NotFound(_)
    ));
    root.delete_value("beta", false).unwrap();
}

#[test]
fn test_delete_all_values_frees_list() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();
    root.set_value("a", &ValueData::String("x".into())).unwrap();
    root.delete_value("a", true).unwrap();

    let node = root.node().unwrap();
    assert_eq!(node.value_count, 0);
    assert_eq!(node.value_list, NO_INDEX);
}

#[test]
fn test_subkeys_enumerate_sorted() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();

    for name in ["delta", "Charlie", "alpha", "Bravo"] {
        root.create_subkey(name).unwrap();
    }
    assert_eq!(
        root.subkey_names().unwrap(),
        vec!["alpha", "Bravo", "Charlie", "delta"]
    );
}

#[test]
fn test_hash_leaf_lists() {
    let options = HiveOptions::default().with_subkey_list_type(SubkeyListType::HashLeaf);
    let mut hive = RegistryHive::create_with_options(Cursor::new(Vec::new()), options).unwrap();
    let mut root = hive.root_key().unwrap();

    for name in ["Alpha", "Bravo", "Charlie"] {
        root.create_subkey(name).unwrap();
    }
    let list = root.node().unwrap().subkey_list;

    for name in ["Alpha", "bravo", "CHARLIE"] {
        assert!(root.open_subkey(name).unwrap().is_some(), "missing {}", name);
    }
    assert!(root.open_subkey("Delta").unwrap().is_none());

    let cell = hive.any_cell(list).unwrap();
    match cell {
        reg_hive::Cell::SubKeyHashedList(list) => {
            assert_eq!(list.list_type, SubkeyListType::HashLeaf);
            assert_eq!(list.len(), 3);
        }
        other => panic!("unexpected list {:?}", other),
    }
}

#[test]
fn test_delete_subkey() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();
    root.create_subkey("Parent\\Child").unwrap();

    let err = root.delete_subkey("Parent", true).unwrap_err();
    assert!(matches!(err, RegistryError::HasSubkeys(_)));

    root.delete_subkey("Parent\\Child", true).unwrap();
    root.delete_subkey("Parent", true).unwrap();
    assert!(root.open_subkey("Parent").unwrap().is_none());
    assert_eq!(root.subkey_count().unwrap(), 0);
    assert_eq!(root.node().unwrap().subkey_list, NO_INDEX);

    assert!(matches!(
        root.delete_subkey("Parent", true).unwrap_err(),
        RegistryError::NotFound(_)
    ));
    root.delete_subkey("Parent", false).unwrap();
}

#[test]
fn test_delete_subkey_frees_values() {
    let mut hive = new_hive();
    let free_before: u32 = hive.bins().iter().map(|b| b.free_space()).sum();

    {
        let mut root = hive.root_key().unwrap();
        let mut key = root.create_subkey("Temp").unwrap();
        key.set_value("blob", &ValueData::Binary(vec![7; 100])).unwrap();
        key.set_value("n", &ValueData::Dword(5)).unwrap();
        key.set_class_name(Some("cls")).unwrap();
        root.delete_subkey("Temp", true).unwrap();
    }

    let free_after: u32 = hive.bins().iter().map(|b| b.free_space()).sum();
    assert_eq!(free_before, free_after);
    assert_eq!(hive.bins()[0].free_ranges().len(), 1);
}

#[test]
fn test_delete_subkey_tree() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();
    root.create_subkey("Tree\\A\\B").unwrap();
    root.create_subkey("Tree\\C").unwrap();
    root.create_subkey("Keep").unwrap();

    root.delete_subkey_tree("Tree").unwrap();
    assert!(root.open_subkey("Tree").unwrap().is_none());
    assert_eq!(root.subkey_names().unwrap(), vec!["Keep"]);

    root.delete_subkey_tree("Tree").unwrap();
}

#[test]
fn test_delete_root_rejected() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();
    assert!(matches!(
        root.delete_subkey_tree("").unwrap_err(),
        RegistryError::DeleteRoot
    ));
}

#[test]
fn test_security_inherited_and_released() {
    let mut hive = new_hive();
    let root_security = hive.root_node().unwrap().security;

    {
        let mut root = hive.root_key().unwrap();
        root.create_subkey("One").unwrap();
        root.create_subkey("Two").unwrap();
    }
    assert_eq!(hive.cell::<SecurityCell>(root_security).unwrap().usage_count, 3);

    {
        let mut root = hive.root_key().unwrap();
        root.delete_subkey("One", true).unwrap();
    }
    assert_eq!(hive.cell::<SecurityCell>(root_security).unwrap().usage_count, 2);
}

#[test]
fn test_security_dedup_ring() {
    let mut hive = new_hive();
    let descriptor = vec![1u8, 0, 4, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

    let shared = {
        let mut root = hive.root_key().unwrap();
        let mut x = root.create_subkey("X").unwrap();
        x.set_security_descriptor(&descriptor).unwrap();
        let shared = x.node().unwrap().security;

        let mut y = root.create_subkey("Y").unwrap();
        y.set_security_descriptor(&descriptor).unwrap();
        assert_eq!(y.node().unwrap().security, shared);
        assert_eq!(y.security_descriptor().unwrap(), Some(descriptor.clone()));
        shared
    };

    let cell: SecurityCell = hive.cell(shared).unwrap();
    assert_eq!(cell.usage_count, 2);
    assert_eq!(ring_indices(&hive).len(), 2);

    {
        let mut root = hive.root_key().unwrap();
        root.delete_subkey("X", true).unwrap();
        root.delete_subkey("Y", true).unwrap();
    }

    assert_eq!(hive.get_cell::<SecurityCell>(shared).unwrap(), None);
    let ring = hive.security_ring().unwrap();
    assert_eq!(ring.len(), 1);
    assert_eq!(ring[0].next, ring[0].index);
    assert_eq!(ring[0].previous, ring[0].index);
}

#[test]
fn test_security_ring_unlinks_middle_member() {
    let mut hive = new_hive();
    let descriptor = |tag: u8| vec![1u8, 0, 4, 0x80, tag, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

    {
        let mut root = hive.root_key().unwrap();
        for (name, tag) in [("A", 1u8), ("B", 2), ("C", 3)] {
            let mut key = root.create_subkey(name).unwrap();
            key.set_security_descriptor(&descriptor(tag)).unwrap();
        }
    }

    let before = ring_indices(&hive);
    assert_eq!(before.len(), 4);
    let middle = {
        let mut root = hive.root_key().unwrap();
        root.open_subkey("B").unwrap().unwrap().node().unwrap().security
    };
    assert_eq!(before[2], middle);

    {
        let mut root = hive.root_key().unwrap();
        root.delete_subkey("B", true).unwrap();
    }
    assert_eq!(hive.get_cell::<SecurityCell>(middle).unwrap(), None);

    let ring = hive.security_ring().unwrap();
    let forward: Vec<i32> = ring.iter().map(|c| c.index).collect();
    assert_eq!(forward, vec![before[0], before[1], before[3]]);

    for (i, cell) in ring.iter().enumerate() {
        assert_eq!(cell.next, ring[(i + 1) % ring.len()].index);
        assert_eq!(cell.previous, ring[(i + ring.len() - 1) % ring.len()].index);
    }

    let mut backward = Vec::new();
    let mut current = forward[0];
    loop {
        let cell: SecurityCell = hive.cell(current).unwrap();
        backward.push(cell.index);
        current = cell.previous;
        if current == forward[0] {
            break;
        }
        assert!(backward.len() <= forward.len());
    }
    assert_eq!(backward, vec![before[0], before[3], before[1]]);
}

#[test]
fn test_bin_growth() {
    let mut hive = new_hive();
    let length = hive.header().length;
    let sequence = hive.header().sequence1;

    {
        let mut root = hive.root_key().unwrap();
        root.set_value("big", &ValueData::Binary(vec![0xAB; 0x1800])).unwrap();
    }

    assert_eq!(hive.bins().len(), 2);
    let added = hive.bins()[1].size();
    assert_eq!(hive.header().length, length + added);
    assert_eq!(hive.header().sequence1, sequence + 1);
    assert_eq!(hive.header().sequence2, sequence + 1);

    let mut hive = reopen(hive);
    let root = hive.root_key().unwrap();
    assert_eq!(
        root.get_value("big").unwrap(),
        Some(ValueData::Binary(vec![0xAB; 0x1800]))
    );
}

#[test]
fn test_large_value_round_trip() {
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();

    let mut hive = new_hive();
    {
        let mut root = hive.root_key().unwrap();
        let mut key = root.create_subkey("Large").unwrap();
        key.set_value("payload", &ValueData::Binary(payload.clone())).unwrap();
        assert_eq!(key.node().unwrap().max_value_data_len, 64 * 1024);
    }

    let mut hive = reopen(hive);
    let mut root = hive.root_key().unwrap();
    let key = root.open_subkey("Large").unwrap().unwrap();
    let value = key.value("payload").unwrap().unwrap();
    assert_eq!(value.raw_data().unwrap(), payload);
}

#[test]
fn test_big_data_on_newer_format() {
    let mut bytes = new_hive().into_inner().into_inner();
    let mut header = HiveHeader::parse(&bytes).unwrap();
    header.minor_version = 5;
    header.write_to(&mut bytes[..512]).unwrap();

    let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 199) as u8).collect();
    let mut hive = RegistryHive::open(Cursor::new(bytes)).unwrap();
    {
        let mut root = hive.root_key().unwrap();
        root.set_value("big", &ValueData::Binary(payload.clone())).unwrap();
    }

    let data_index = {
        let root = hive.root_node().unwrap();
        let (_, cell) = hive.find_value(&root, "big").unwrap().unwrap();
        cell.data_index
    };
    assert_eq!(&hive.raw_cell_data(data_index, 2).unwrap(), b"db");

    let mut hive = reopen(hive);
    {
        let mut root = hive.root_key().unwrap();
        let value = root.value("big").unwrap().unwrap();
        assert_eq!(value.raw_data().unwrap(), payload);

        root.set_value("big", &ValueData::Dword(1)).unwrap();
        assert_eq!(root.get_value("big").unwrap(), Some(ValueData::Dword(1)));
    }
    assert_eq!(hive.get_cell::<reg_hive::BigDataCell>(data_index).unwrap(), None);
}

#[test]
fn test_many_subkeys_persist() {
    let mut hive = new_hive();
    {
        let mut root = hive.root_key().unwrap();
        let mut parent = root.create_subkey("Many").unwrap();
        for i in 0..300 {
            parent.create_subkey(&format!("Key{:04}", i)).unwrap();
        }
    }

    let mut hive = reopen(hive);
    let mut root = hive.root_key().unwrap();
    let mut parent = root.open_subkey("many").unwrap().unwrap();
    assert_eq!(parent.subkey_count().unwrap(), 300);

    let names = parent.subkey_names().unwrap();
    let mut sorted = names.clone();
    sorted.sort_by_key(|n| n.to_uppercase());
    assert_eq!(names, sorted);

    assert!(parent.open_subkey("KEY0150").unwrap().is_some());
    parent.delete_subkey("key0150", true).unwrap();
    assert!(parent.open_subkey("KEY0150").unwrap().is_none());
    assert_eq!(parent.subkey_count().unwrap(), 299);
}

#[test]
fn test_small_leaves_split_and_survive() {
    let options = HiveOptions::default().with_max_leaf_entries(4);
    let mut hive = RegistryHive::create_with_options(Cursor::new(Vec::new()), options).unwrap();
    let mut names: Vec<String> = (0..40).map(|i| format!("Key{:02}", (i * 17) % 40)).collect();

    {
        let mut root = hive.root_key().unwrap();
        let mut parent = root.create_subkey("Split").unwrap();
        for name in &names {
            parent.create_subkey(name).unwrap();
        }
        let list = parent.node().unwrap().subkey_list;
        match parent.hive().any_cell(list).unwrap() {
            reg_hive::Cell::SubKeyIndirectList(ri) => {
                assert!(ri.is_index_root());
                for leaf in ri.entries {
                    assert!(parent.hive().subkey_count_in(leaf).unwrap() <= 4);
                }
            }
            other => panic!("unexpected list {:?}", other),
        }
    }

    names.sort();
    let mut hive = reopen(hive);
    let mut root = hive.root_key().unwrap();
    let mut parent = root.open_subkey("Split").unwrap().unwrap();
    assert_eq!(parent.subkey_count().unwrap(), 40);
    assert_eq!(parent.subkey_names().unwrap(), names);

    for name in names.iter().step_by(2) {
        parent.delete_subkey(name, true).unwrap();
    }
    for (i, name) in names.iter().enumerate() {
        assert_eq!(parent.open_subkey(name).unwrap().is_some(), i % 2 == 1, "{}", name);
    }
    assert_eq!(parent.subkey_count().unwrap(), 20);
}

#[test]
fn test_unicode_names() {
    let mut hive = new_hive();
    {
        let mut root = hive.root_key().unwrap();
        let mut key = root.create_subkey("Ключ\\日本").unwrap();
        key.set_value("Значение", &ValueData::String("данные".into())).unwrap();
    }

    let mut hive = reopen(hive);
    let mut root = hive.root_key().unwrap();
    let key = root.open_subkey("КЛЮЧ\\日本").unwrap().unwrap();
    assert_eq!(key.name().unwrap(), "Ключ\\日本");
    assert_eq!(
        key.get_value("значение").unwrap(),
        Some(ValueData::String("данные".into()))
    );
}

#[test]
fn test_value_display() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();
    root.set_value("n", &ValueData::Dword(7)).unwrap();
    root.set_value("b", &ValueData::Binary((0u8..12).collect())).unwrap();

    let shown: Vec<String> = root.values().unwrap().iter().map(|v| v.to_string()).collect();
    assert_eq!(
        shown,
        vec![
            "b:REG_BINARY:0001020304050607 (12 bytes)".to_string(),
            "n:REG_DWORD:7".to_string(),
        ]
    );
}

#[test]
fn test_file_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.hiv");

    {
        let mut hive = RegistryHive::create_file(&path).unwrap();
        let mut root = hive.root_key().unwrap();
        let mut key = root.create_subkey("Software\\Vendor").unwrap();
        key.set_value("Path", &ValueData::String("C:\\Program Files".into())).unwrap();
        drop(root);
        hive.flush().unwrap();
    }

    let mut hive = RegistryHive::open_file(&path).unwrap();
    let mut root = hive.root_key().unwrap();
    let key = root.open_subkey("software\\vendor").unwrap().unwrap();
    assert_eq!(
        key.get_value("path").unwrap(),
        Some(ValueData::String("C:\\Program Files".into()))
    );

    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len, 0x1000 + u64::from(hive.header().length));
}

#[test]
fn test_parent_links() {
    let mut hive = new_hive();
    let mut root = hive.root_key().unwrap();
    let mut c = root.create_subkey("A\\B\\C").unwrap();

    let node: KeyNode = c.node().unwrap();
    let mut b = c.parent().unwrap().unwrap();
    assert_eq!(b.index(), node.parent);
    assert_eq!(b.name().unwrap(), "A\\B");

    let mut a = b.parent().unwrap().unwrap();
    let mut top = a.parent().unwrap().unwrap();
    assert!(top.flags().unwrap().is_root());
    assert!(top.parent().unwrap().is_none());
}
