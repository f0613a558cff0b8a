use rustgt::config::{ConfigFile, SectionKind};
use rustgt::core::TargetError;

const SAMPLE: &str = r#"
# rustgt sample configuration
[Global]
Comment "Global section"
NodeBase "iqn.2016-04.org.rustgt"
PidFile /var/run/rustgt.pid

[UnitControl]
Portal UC1 127.0.0.1:3261

[PortalGroup1]
Portal DA1 10.0.0.1:3260
Portal DA2 10.0.0.2:3260

[InitiatorGroup1]
InitiatorName "iqn.1991-05.com.microsoft:saturn"
InitiatorName "iqn.1991-05.com.microsoft:jupiter"
Netmask 10.0.0.0/24

[LogicalUnit1]
TargetName disk1
"#;

#[test]
fn test_parse_sections_and_kinds() {
    let cfg = ConfigFile::parse(SAMPLE, "sample.conf").unwrap();
    assert!(!cfg.is_empty());
    assert_eq!(cfg.sections().len(), 5);

    let global = cfg.find("Global").unwrap();
    assert_eq!(global.kind, SectionKind::Global);
    assert_eq!(global.num, 0);

    let pg = cfg.find("PortalGroup1").unwrap();
    assert_eq!(pg.kind, SectionKind::PortalGroup);
    assert_eq!(pg.num, 1);
}

#[test]
fn test_quoted_values_are_one_word() {
    let cfg = ConfigFile::parse(SAMPLE, "sample.conf").unwrap();
    let global = cfg.find("Global").unwrap();
    assert_eq!(global.val("Comment"), Some("Global section"));
    assert_eq!(global.val("NodeBase"), Some("iqn.2016-04.org.rustgt"));
}

#[test]
fn test_nval_indexes_repeated_keys() {
    let cfg = ConfigFile::parse(SAMPLE, "sample.conf").unwrap();
    let ig = cfg.find("InitiatorGroup1").unwrap();
    assert_eq!(
        ig.nval("InitiatorName", 0),
        Some("iqn.1991-05.com.microsoft:saturn")
    );
    assert_eq!(
        ig.nval("InitiatorName", 1),
        Some("iqn.1991-05.com.microsoft:jupiter")
    );
    assert_eq!(ig.nval("InitiatorName", 2), None);
    assert_eq!(ig.count("InitiatorName"), 2);
}

#[test]
fn test_nmval_indexes_columns() {
    let cfg = ConfigFile::parse(SAMPLE, "sample.conf").unwrap();
    let pg = cfg.find("PortalGroup1").unwrap();
    assert_eq!(pg.nmval("Portal", 0, 0), Some("DA1"));
    assert_eq!(pg.nmval("Portal", 0, 1), Some("10.0.0.1:3260"));
    assert_eq!(pg.nmval("Portal", 1, 0), Some("DA2"));
    assert_eq!(pg.nmval("Portal", 1, 2), None);
}

#[test]
fn test_keys_are_case_insensitive() {
    let cfg = ConfigFile::parse(SAMPLE, "sample.conf").unwrap();
    let pg = cfg.find("portalgroup1").unwrap();
    assert_eq!(pg.nmval("portal", 0, 0), Some("DA1"));
}

#[test]
fn test_has_numbered() {
    let cfg = ConfigFile::parse(SAMPLE, "sample.conf").unwrap();
    assert!(cfg.has_numbered(SectionKind::PortalGroup, 1));
    assert!(!cfg.has_numbered(SectionKind::PortalGroup, 2));
    assert!(cfg.has_numbered(SectionKind::LogicalUnit, 1));
}

#[test]
fn test_continuation_lines_join() {
    let text = "[InitiatorGroup1]\nInitiatorName \\\n iqn.example:host\n";
    let cfg = ConfigFile::parse(text, "c.conf").unwrap();
    let ig = cfg.find("InitiatorGroup1").unwrap();
    assert_eq!(ig.nval("InitiatorName", 0), Some("iqn.example:host"));
}

#[test]
fn test_comments_and_blanks_are_skipped() {
    let text = "# leading comment\n\n[Global]\n# inner comment\nTimeout 90\n";
    let cfg = ConfigFile::parse(text, "c.conf").unwrap();
    assert_eq!(cfg.sections().len(), 1);
    assert_eq!(cfg.find("Global").unwrap().val("Timeout"), Some("90"));
}

#[test]
fn test_item_outside_section_fails() {
    let err = ConfigFile::parse("Portal DA1 10.0.0.1\n", "c.conf").unwrap_err();
    assert!(matches!(err, TargetError::ConfigFile(_)));
}

#[test]
fn test_unterminated_header_fails() {
    let err = ConfigFile::parse("[Global\n", "c.conf").unwrap_err();
    assert!(matches!(err, TargetError::ConfigFile(_)));
}

#[test]
fn test_unterminated_quote_fails() {
    let err = ConfigFile::parse("[Global]\nComment \"oops\n", "c.conf").unwrap_err();
    assert!(matches!(err, TargetError::ConfigFile(_)));
}

#[test]
fn test_unknown_section_is_tolerated() {
    let cfg = ConfigFile::parse("[SomethingElse9]\nKey v\n", "c.conf").unwrap();
    let sp = cfg.find("SomethingElse9").unwrap();
    assert_eq!(sp.kind, SectionKind::Unknown);
    assert_eq!(sp.num, 9);
}

#[test]
fn test_load_missing_file_fails() {
    let err = ConfigFile::load("/nonexistent/rustgt.conf").unwrap_err();
    assert!(matches!(err, TargetError::ConfigFile(_)));
}
