//! Discovery, dependency resolution and lifecycle ordering.

use modhost_core::{HostAbi, PackedVersion, PluginManager, SpecState, VerificationRecord};
use modhost_testing::{
    events, reset_events, serial, write_plain_file, write_plugin_file, Fixture, FixtureDir,
};

fn manager_for(fixtures: &FixtureDir) -> PluginManager {
    let mut manager = PluginManager::new(fixtures.runtime());
    manager.set_plugin_paths(vec![fixtures.path().to_path_buf()]);
    manager
}

#[test]
fn test_dependencies_initialize_first_and_stop_last() {
    let _guard = serial();
    reset_events();
    let fixtures = FixtureDir::new("manager_order");
    fixtures.add(Fixture::Welcome);
    fixtures.add(Fixture::Editor);
    fixtures.add(Fixture::Core);

    let mut manager = manager_for(&fixtures);
    assert_eq!(manager.discover(), 3);
    manager.load_plugins();

    assert!(!manager.has_errors());
    assert_eq!(manager.load_order(), vec!["Core", "Editor", "Welcome"]);
    for spec in manager.plugins() {
        assert_eq!(spec.state(), SpecState::Running, "{}", spec.name());
        assert_eq!(spec.version(), "0.1.0");
    }
    assert_eq!(
        events(),
        vec![
            "initialize:Core",
            "initialize:Editor",
            "initialize:Welcome",
            "extensions_initialized:Welcome",
            "extensions_initialized:Editor",
            "extensions_initialized:Core",
        ]
    );

    reset_events();
    manager.shutdown();
    assert_eq!(
        events(),
        vec![
            "about_to_shutdown:Welcome",
            "about_to_shutdown:Editor",
            "about_to_shutdown:Core",
            "destroy:Welcome",
            "destroy:Editor",
            "destroy:Core",
        ]
    );
    assert!(manager
        .plugins()
        .iter()
        .all(|s| s.state() == SpecState::Deleted));
    assert_eq!(fixtures.linker().live_mappings(), 0);
}

#[test]
fn test_failed_initialization_is_isolated() {
    let _guard = serial();
    reset_events();
    let fixtures = FixtureDir::new("manager_broken");
    fixtures.add(Fixture::Core);
    fixtures.add(Fixture::Broken);

    let mut manager = manager_for(&fixtures);
    manager.discover();
    manager.load_plugins();

    let broken = manager.plugin_by_name("Broken").unwrap();
    assert!(broken.has_error());
    assert!(broken
        .error_string()
        .unwrap()
        .starts_with("Plugin initialization failed"));
    assert_eq!(manager.plugin_by_name("Core").unwrap().state(), SpecState::Running);
    assert!(!events().contains(&"extensions_initialized:Broken".to_string()));
}

#[test]
fn test_missing_dependency_is_reported() {
    let _guard = serial();
    let fixtures = FixtureDir::new("manager_orphan");
    fixtures.add(Fixture::Orphan);
    fixtures.add(Fixture::Editor);

    let mut manager = manager_for(&fixtures);
    manager.discover();
    manager.load_plugins();

    let orphan = manager.plugin_by_name("Orphan").unwrap();
    assert_eq!(
        orphan.error_string(),
        Some("Could not resolve dependency 'Missing()'")
    );
    let editor = manager.plugin_by_name("Editor").unwrap();
    assert!(editor.error_string().unwrap().contains("'Core(^0.1)'"));
    assert!(manager.load_order().is_empty());
}

#[test]
fn test_failure_propagates_to_dependents() {
    let _guard = serial();
    let fixtures = FixtureDir::new("manager_propagate");
    fixtures.add(Fixture::Editor);
    fixtures.add(Fixture::Welcome);

    let mut manager = manager_for(&fixtures);
    manager.discover();
    manager.load_plugins();

    let welcome = manager.plugin_by_name("Welcome").unwrap();
    assert_eq!(
        welcome.error_string(),
        Some("Cannot load plugin because dependency failed to load: Editor")
    );
}

#[test]
fn test_duplicate_plugin_does_not_break_dependents() {
    let _guard = serial();
    reset_events();
    let fixtures = FixtureDir::new("manager_duplicate");
    let first = fixtures.path().join("install");
    let second = fixtures.path().join("user");
    let record = HostAbi::current().record();
    let mut cores = Vec::new();
    for dir in [&first, &second] {
        std::fs::create_dir_all(dir).unwrap();
        let path = write_plugin_file(dir, "libCore.so", &record);
        fixtures.linker().install(&path, Fixture::Core.symbols());
        cores.push(path);
    }
    let editor = write_plugin_file(&second, "libEditor.so", &record);
    fixtures.linker().install(&editor, Fixture::Editor.symbols());

    let mut manager = PluginManager::new(fixtures.runtime());
    manager.set_plugin_paths(vec![first.clone(), second.clone()]);
    assert_eq!(manager.discover(), 3);
    manager.load_plugins();

    let copy = manager
        .plugins()
        .iter()
        .find(|s| s.location() == cores[1])
        .unwrap();
    assert!(copy.error_string().unwrap().contains("is already loaded from"));

    let core = manager.plugin_by_name("Core").unwrap();
    assert_eq!(core.location(), cores[0]);
    assert_eq!(core.state(), SpecState::Running);
    let editor = manager.plugin_by_name("Editor").unwrap();
    assert!(!editor.has_error(), "{:?}", editor.error_string());
    assert_eq!(editor.state(), SpecState::Running);
    assert_eq!(manager.load_order(), vec!["Core", "Editor"]);
    assert_eq!(
        events(),
        vec![
            "initialize:Core",
            "initialize:Editor",
            "extensions_initialized:Editor",
            "extensions_initialized:Core",
        ]
    );
}

#[test]
fn test_version_requirement_is_enforced() {
    let _guard = serial();
    let fixtures = FixtureDir::new("manager_future");
    fixtures.add(Fixture::Core);
    fixtures.add(Fixture::Future);

    let mut manager = manager_for(&fixtures);
    manager.discover();
    manager.load_plugins();

    let future = manager.plugin_by_name("Future").unwrap();
    assert_eq!(
        future.error_string(),
        Some("Dependency 'Core' requires version ^2, found 0.1.0")
    );
    assert_eq!(manager.load_order(), vec!["Core"]);
}

#[test]
fn test_cycles_are_detected() {
    let _guard = serial();
    let fixtures = FixtureDir::new("manager_cycle");
    fixtures.add(Fixture::CycleA);
    fixtures.add(Fixture::CycleB);
    fixtures.add(Fixture::Core);

    let mut manager = manager_for(&fixtures);
    manager.discover();
    manager.load_plugins();

    for name in ["CycleA", "CycleB"] {
        let spec = manager.plugin_by_name(name).unwrap();
        assert!(
            spec.error_string()
                .unwrap()
                .starts_with("Circular dependency detected:"),
            "{name}: {:?}",
            spec.error_string()
        );
    }
    assert_eq!(manager.load_order(), vec!["Core"]);
}

#[test]
fn test_disabled_plugin_is_not_initialized() {
    let _guard = serial();
    reset_events();
    let fixtures = FixtureDir::new("manager_disabled");
    fixtures.add(Fixture::Core);
    fixtures.add(Fixture::Editor);
    fixtures.add(Fixture::Welcome);

    let mut manager = manager_for(&fixtures);
    manager.set_disabled_plugins(["Editor"]);
    manager.discover();
    manager.load_plugins();

    let editor = manager.plugin_by_name("Editor").unwrap();
    assert!(!editor.is_enabled());
    assert!(!editor.has_error());
    assert!(editor.instance().is_none());

    let welcome = manager.plugin_by_name("Welcome").unwrap();
    assert!(welcome.error_string().unwrap().contains("'Editor(^0.1)'"));
    assert_eq!(manager.load_order(), vec!["Core"]);
    assert!(!events().contains(&"initialize:Editor".to_string()));
    assert!(events().contains(&"destroy:Editor".to_string()));
}

#[test]
fn test_discovery_filters_and_keeps_rejections() {
    let _guard = serial();
    let fixtures = FixtureDir::new("manager_discover");
    fixtures.add(Fixture::Core);
    write_plain_file(fixtures.path(), "libnotes.so");
    std::fs::write(fixtures.path().join("README.txt"), "not a library").unwrap();

    let nested = fixtures.path().join("extra");
    std::fs::create_dir_all(&nested).unwrap();
    let host = HostAbi::current();
    let old = VerificationRecord::new(
        PackedVersion::new(host.version.major().wrapping_add(1), 0, 0),
        host.debug,
        host.build_key.clone(),
    );
    let nested_path = modhost_testing::write_plugin_file(&nested, "libStale.so", &old);
    fixtures.linker().install(&nested_path, Fixture::Editor.symbols());

    let mut manager = manager_for(&fixtures);
    assert_eq!(manager.discover(), 2);
    // A second walk finds nothing new.
    assert_eq!(manager.discover(), 0);

    let stale = manager
        .plugins()
        .iter()
        .find(|s| s.location() == nested_path)
        .unwrap();
    assert_eq!(stale.name(), "Stale");
    assert!(stale.error_string().unwrap().contains("incompatible"));

    manager.load_plugins();
    assert_eq!(manager.load_order(), vec!["Core"]);
    assert_eq!(fixtures.linker().opens(&nested_path), 0);
}

#[test]
fn test_initialize_receives_arguments_and_missing_paths_are_ignored() {
    let _guard = serial();
    let fixtures = FixtureDir::new("manager_paths");
    fixtures.add(Fixture::Core);

    let mut manager = PluginManager::new(fixtures.runtime());
    manager.set_plugin_paths(vec![
        fixtures.path().join("does-not-exist"),
        fixtures.path().to_path_buf(),
    ]);
    manager.set_arguments(vec!["-safe-mode".to_string()]);
    assert_eq!(manager.discover(), 1);
    manager.load_plugins();
    assert_eq!(manager.plugin_by_name("Core").unwrap().state(), SpecState::Running);
}
