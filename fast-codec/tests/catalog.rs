use fast_codec::catalog::{Catalog, CatalogBuilder};
use fast_codec::{CatalogError, CodecError};
use fast_token::{GroupFlags, TypeTag};

const EXAMPLE_XML: &[u8] = include_bytes!("../templates/example.xml");

fn example_catalog() -> Catalog {
    CatalogBuilder::new().load_xml(EXAMPLE_XML).unwrap()
}

#[test]
fn example_catalog_shape() {
    let catalog = example_catalog();
    assert_eq!(catalog.templates().len(), 3);
    assert_eq!(catalog.script_len(), 54);

    let first = catalog.token(0);
    assert_eq!(first.type_tag(), TypeTag::Group);
    assert!(first.group_flags().contains(GroupFlags::OPEN | GroupFlags::TEMPLATE));
    let last = catalog.token(53);
    assert_eq!(last.type_tag(), TypeTag::Group);
    assert!(last.group_flags().contains(GroupFlags::CLOSE | GroupFlags::TEMPLATE));

    assert_eq!(catalog.template_start(1), Some(0));
    assert_eq!(catalog.template_start(2), Some(3));
    assert_eq!(catalog.template_start(99), Some(36));
    assert_eq!(catalog.template_start(7), None);

    assert_eq!(catalog.max_pmap_bytes(), 2);
    assert_eq!(catalog.max_group_depth(), 2);
}

#[test]
fn example_catalog_binary_size_is_stable() {
    let catalog = example_catalog();
    let image = catalog.to_bytes().unwrap();
    assert_eq!(image.len(), 762);
    assert_eq!(&image[..8], b"FASTCAT0");
}

#[test]
fn identical_xml_yields_identical_bytes() {
    let a = example_catalog().to_bytes().unwrap();
    let b = example_catalog().to_bytes().unwrap();
    assert_eq!(a, b);
}

#[test]
fn binary_round_trip_preserves_everything() {
    let built = example_catalog();
    let image = built.to_bytes().unwrap();
    let reloaded = Catalog::from_bytes(&image).unwrap();
    assert_eq!(reloaded.to_bytes().unwrap(), image);
    assert_eq!(reloaded.script(), built.script());
    assert_eq!(reloaded.templates(), built.templates());
    assert_eq!(reloaded.max_pmap_bytes(), built.max_pmap_bytes());
    for pos in [0usize, 3, 14, 36] {
        assert_eq!(reloaded.fragment_slots(pos), built.fragment_slots(pos));
        assert_eq!(
            reloaded.fragment_script_len(pos),
            built.fragment_script_len(pos)
        );
    }
}

#[test]
fn fragment_tables_split_at_the_sequence() {
    let catalog = example_catalog();
    // Heartbeat: header + one int + trailer.
    assert_eq!(catalog.fragment_slots(0), 3);
    assert_eq!(catalog.fragment_script_len(0), 3);
    // MDIncRefresh leading fragment runs through the sequence length.
    assert_eq!(catalog.fragment_slots(3), 18);
    assert_eq!(catalog.fragment_script_len(3), 11);
    // Sequence body fragment.
    assert_eq!(catalog.fragment_slots(14), 29);
    assert_eq!(catalog.fragment_script_len(14), 21);
    // NewOrderSingle is one fragment.
    assert_eq!(catalog.fragment_slots(36), 28);
    assert_eq!(catalog.fragment_script_len(36), 18);
}

#[test]
fn constants_pool_in_declaration_order() {
    let catalog = example_catalog();
    let pool: Vec<&[u8]> = catalog.constants().iter().map(Vec::as_slice).collect();
    assert_eq!(pool, [b"8".as_slice(), b"X", b"8", b"D", b"1"]);
    // Position 4 is ApplVerID, the first constant field.
    assert_eq!(catalog.constant_index(4), Some(0));
    assert_eq!(catalog.constant_index(5), Some(1));
    assert_eq!(catalog.constant_index(19), Some(2));
    assert_eq!(catalog.constant_index(6), None);
}

#[test]
fn truncated_image_is_rejected() {
    let image = example_catalog().to_bytes().unwrap();
    for cut in [0, 7, 23, 100, image.len() - 1] {
        match Catalog::from_bytes(&image[..cut]) {
            Err(CatalogError::BadMagic | CatalogError::Truncated) => {}
            other => panic!("cut at {cut}: {other:?}"),
        }
    }
}

#[test]
fn legacy_version_is_rejected() {
    let mut image = example_catalog().to_bytes().unwrap();
    image[8] = 1; // version field, little-endian
    match Catalog::from_bytes(&image) {
        Err(CatalogError::UnsupportedVersion(1)) => {}
        other => panic!("{other:?}"),
    }
}

#[test]
fn decimal_without_both_subfields_is_rejected() {
    let xml = br#"<templates>
        <template name="t" id="1">
            <decimal name="Px"><exponent><copy/></exponent></decimal>
        </template>
    </templates>"#;
    match CatalogBuilder::new().load_xml(xml) {
        Err(CodecError::Catalog(CatalogError::DecimalSubfieldMissing(name))) => {
            assert_eq!(name, "Px");
        }
        other => panic!("{other:?}"),
    }
}

#[test]
fn reserved_dictionary_name_is_rejected() {
    let xml = br#"<templates>
        <template name="t" id="1" dictionary="template:9">
            <uInt32 name="A"/>
        </template>
    </templates>"#;
    match CatalogBuilder::new().load_xml(xml) {
        Err(CodecError::Catalog(CatalogError::DictionaryNameCollision(_))) => {}
        other => panic!("{other:?}"),
    }
}

#[test]
fn named_dictionary_emits_reset_marker() {
    let xml = br#"<templates>
        <template name="t" id="5" dictionary="md">
            <uInt32 name="A"><copy/></uInt32>
        </template>
    </templates>"#;
    let catalog = CatalogBuilder::new().load_xml(xml).unwrap();
    let marker = catalog.token(1);
    assert_eq!(marker.type_tag(), TypeTag::Dictionary);
    let group = &catalog.reset_groups()[marker.instance() as usize];
    assert_eq!(group.name, "md");
    assert_eq!(group.entries.len(), 1);
}

#[test]
fn unknown_field_element_is_rejected() {
    let xml = br#"<templates>
        <template name="t" id="1"><float name="X"/></template>
    </templates>"#;
    match CatalogBuilder::new().load_xml(xml) {
        Err(CodecError::Catalog(CatalogError::UndefinedField(name))) => {
            assert_eq!(name, "float");
        }
        other => panic!("{other:?}"),
    }
}
