//! Integration tests for pack

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn pack() -> Command {
        cargo_bin_cmd!("pack")
    }

    #[test]
    fn help_displays() {
        pack()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Cloud Native Buildpacks"));
    }

    #[test]
    fn version_displays() {
        pack()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("pack"));
    }

    #[test]
    fn suggest_builders_lists_heroku() {
        pack()
            .arg("suggest-builders")
            .assert()
            .success()
            .stdout(predicate::str::contains("heroku/buildpacks:18"));
    }

    #[test]
    fn suggest_stacks_lists_bionic() {
        pack()
            .arg("suggest-stacks")
            .assert()
            .success()
            .stdout(predicate::str::contains("io.buildpacks.stacks.bionic"));
    }

    #[test]
    fn completion_prints_script() {
        pack()
            .arg("completion")
            .assert()
            .success()
            .stdout(predicate::str::contains("_pack"));
    }

    #[test]
    fn set_default_builder_writes_config() {
        let home = TempDir::new().unwrap();
        pack()
            .args(["set-default-builder", "cnb/builder:bionic"])
            .env("PACK_HOME", home.path())
            .env("CI", "true")
            .assert()
            .success();

        let config = std::fs::read_to_string(home.path().join("config.toml")).unwrap();
        assert!(config.contains("cnb/builder:bionic"));
    }

    #[test]
    fn set_default_builder_without_name_fails_when_not_interactive() {
        let home = TempDir::new().unwrap();
        pack()
            .arg("set-default-builder")
            .env("PACK_HOME", home.path())
            .env("CI", "true")
            .assert()
            .failure();
    }

    #[test]
    fn create_builder_requires_config_flag() {
        pack()
            .args(["create-builder", "my/builder"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--builder-config"));
    }
}

/// Build, rebuild and cache-corruption cycles driven through the lifecycle
/// steps directly, against a fake image store and a volume cache
mod lifecycle_tests {
    use cnb_pack::archive::{list_entries, Owner};
    use cnb_pack::cache::{Cache, VolumeCache};
    use cnb_pack::dist::{
        labels, BuildpackLayersMetadata, CacheMetadata, LayerMetadata, LayersMetadata, OrderEntry,
    };
    use cnb_pack::image::fake::{FakeImageState, FakeImageStore};
    use cnb_pack::image::ImageFetcher;
    use cnb_pack::layer::LayerStore;
    use cnb_pack::lifecycle::{
        Analyzer, BuildpackLayersDir, Cacher, ExportReport, ExportTarget, Exporter, Restorer,
    };
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    const IMAGE: &str = "my/app";

    struct Workspace {
        layers: TempDir,
        app: TempDir,
        cache: TempDir,
        tools: TempDir,
        store: FakeImageStore,
    }

    impl Workspace {
        fn new() -> Self {
            let app = TempDir::new().unwrap();
            fs::write(app.path().join("app.txt"), "hello").unwrap();
            let tools = TempDir::new().unwrap();
            fs::write(tools.path().join("launcher"), "#!/bin/launcher").unwrap();

            let store = FakeImageStore::new().unwrap();
            let run_top = store.add_blob(b"run base").unwrap();
            store.insert(
                "run:A",
                FakeImageState::default()
                    .with_layers(&[run_top])
                    .with_label(labels::STACK_ID, "io.buildpacks.stacks.bionic"),
            );

            Self {
                layers: TempDir::new().unwrap(),
                app,
                cache: TempDir::new().unwrap(),
                tools,
                store,
            }
        }

        fn group(&self) -> Vec<OrderEntry> {
            vec![OrderEntry::new("bp.one", "1.0")]
        }

        /// Start a build from an empty layers directory at the same path
        fn reset_layers(&self) {
            fs::remove_dir_all(self.layers.path()).unwrap();
            fs::create_dir_all(self.layers.path()).unwrap();
        }

        /// What the buildpack contributes during the build phase
        fn contribute_deps(&self) {
            let deps = BuildpackLayersDir::read(self.layers.path(), "bp.one")
                .unwrap()
                .layer("deps");
            fs::create_dir_all(deps.path()).unwrap();
            fs::write(deps.path().join("dep.txt"), "dependency").unwrap();
            deps.write_metadata(&LayerMetadata {
                data: json!({"lang": "go"}),
                launch: true,
                cache: true,
                ..Default::default()
            })
            .unwrap();
        }

        fn artifacts(&self) -> (TempDir, LayerStore) {
            let dir = TempDir::new().unwrap();
            let store = LayerStore::new(dir.path()).unwrap();
            (dir, store)
        }

        /// restore, analyze, build, export, cache
        async fn build(&self) -> (ExportReport, Vec<String>) {
            self.reset_layers();
            let mut log = Vec::new();

            let mut cache = VolumeCache::new(self.cache.path()).await.unwrap();
            let restorer = Restorer::new(self.group(), self.layers.path());
            log.extend(restorer.restore(&mut cache).await.unwrap());

            let previous = self.store.open(IMAGE, true).await.unwrap();
            let analyzer = Analyzer {
                group: self.group(),
                layers_dir: self.layers.path().to_path_buf(),
                app_dir: self.app.path().to_path_buf(),
            };
            log.extend(analyzer.analyze(previous.as_ref()).unwrap());

            self.contribute_deps();

            let (_export_dir, artifacts) = self.artifacts();
            let exporter = Exporter {
                group: self.group(),
                layers_dir: self.layers.path().to_path_buf(),
                app_dir: self.app.path().to_path_buf(),
                launcher: self.tools.path().join("launcher"),
                artifacts,
                owner: Owner::new(1000, 1000),
                stack: Default::default(),
                launcher_metadata: Default::default(),
            };
            let report = exporter
                .export(ExportTarget {
                    fetcher: &self.store,
                    image: IMAGE,
                    run_image: "run:A",
                    additional_tags: &[],
                    daemon: true,
                })
                .await
                .unwrap();
            log.extend(report.log.iter().cloned());

            let (_cache_dir, artifacts) = self.artifacts();
            let cacher = Cacher {
                group: self.group(),
                layers_dir: self.layers.path().to_path_buf(),
                artifacts,
                owner: Owner::new(1000, 1000),
            };
            let mut cache = VolumeCache::new(self.cache.path()).await.unwrap();
            log.extend(cacher.cache(&mut cache).await.unwrap());

            (report, log)
        }

        async fn cache_metadata(&self) -> CacheMetadata {
            VolumeCache::new(self.cache.path())
                .await
                .unwrap()
                .get_metadata()
                .await
                .unwrap()
        }

        fn image_metadata(&self) -> LayersMetadata {
            let saved = self.store.get(IMAGE).unwrap();
            LayersMetadata::from_label(&saved.labels[labels::LAYERS_METADATA]).unwrap()
        }
    }

    #[tokio::test]
    async fn first_build_exports_and_caches() {
        let ws = Workspace::new();
        let (report, _) = ws.build().await;

        assert!(report.added.contains(&"bp.one:deps".to_string()));

        let metadata = ws.image_metadata();
        let deps = &metadata.buildpacks[0].layers["deps"];
        assert_eq!(deps.data, json!({"lang": "go"}));
        assert!(deps.launch);

        let saved = ws.store.get(IMAGE).unwrap();
        assert_eq!(saved.labels[labels::STACK_ID], "io.buildpacks.stacks.bionic");
        let app_tar = ws.tools.path().join("app.tar");
        fs::write(&app_tar, ws.store.layer_bytes(&metadata.app.sha).unwrap()).unwrap();
        let app_entries = list_entries(&app_tar).unwrap();
        assert!(app_entries.iter().any(|(name, _)| name.ends_with("app.txt")));

        let cached = ws.cache_metadata().await;
        assert_eq!(cached.for_buildpack("bp.one").layers["deps"].sha, deps.sha);
    }

    #[tokio::test]
    async fn rebuild_reuses_unchanged_layers() {
        let ws = Workspace::new();
        let (first, _) = ws.build().await;
        let (second, log) = ws.build().await;

        assert!(second.reused.contains(&"bp.one:deps".to_string()));
        assert!(log.contains(&"Restoring cached layer 'bp.one:deps'".to_string()));
        assert_eq!(
            first.metadata.buildpacks[0].layers["deps"].sha,
            second.metadata.buildpacks[0].layers["deps"].sha
        );
    }

    #[tokio::test]
    async fn corrupted_cache_layer_is_discarded_and_rebuilt() {
        let ws = Workspace::new();
        let (first, _) = ws.build().await;

        let mut cache = VolumeCache::new(ws.cache.path()).await.unwrap();
        let mut corrupted = cache.get_metadata().await.unwrap();
        corrupted.buildpacks = vec![BuildpackLayersMetadata {
            id: "bp.one".to_string(),
            version: "1.0".to_string(),
            layers: [(
                "deps".to_string(),
                LayerMetadata {
                    sha: "sha256:corrupt".to_string(),
                    data: json!({"lang": "go"}),
                    launch: true,
                    cache: true,
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
        }];
        cache.set_metadata(&corrupted).await.unwrap();
        cache.commit().await.unwrap();

        let (second, log) = ws.build().await;

        assert!(log.contains(&"Removing stale cached launch layer 'bp.one:deps'".to_string()));
        assert_eq!(
            second.metadata.buildpacks[0].layers["deps"].sha,
            first.metadata.buildpacks[0].layers["deps"].sha
        );
        let cached = ws.cache_metadata().await;
        assert_ne!(cached.for_buildpack("bp.one").layers["deps"].sha, "sha256:corrupt");
    }
}
