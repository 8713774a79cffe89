mod common;

use common::{gm, object, player, registry, ActorBehavior, CountingBackend};
use folio_core::{
    Backend, CompendiumCollection, CompendiumConfiguration, CompendiumMetadata, DocumentError,
    ImportAllOptions, ModificationOptions, PackCacheConfig, Query, Scope, SettingsStore, World,
    CONFIG_SETTING,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const GOBLIN: &str = "goblin0000000001";
const ORC: &str = "orc0000000000001";
const MONSTERS: &str = "dnd5e.monsters";

fn world_with(backend: &Arc<CountingBackend>) -> World {
    World::new(
        registry(Arc::new(ActorBehavior::default())),
        backend.clone(),
        backend.clone(),
    )
    .expect("world")
}

async fn seed(backend: &Arc<CountingBackend>, goblin_hp: i64) {
    backend
        .create_documents(
            &Scope::collection(MONSTERS),
            vec![
                object(json!({
                    "_id": GOBLIN,
                    "name": "Goblin",
                    "type": "npc",
                    "hp": goblin_hp,
                    "items": [{"_id": "scimitar00000001", "name": "Scimitar", "weight": 3}]
                })),
                object(json!({"_id": ORC, "name": "Orc", "type": "npc", "hp": 15})),
            ],
            &ModificationOptions::keep_id(),
        )
        .await
        .expect("seed pack");
}

async fn monsters(world: &World) -> CompendiumCollection {
    world
        .register_pack(CompendiumMetadata::new("dnd5e", "monsters", "Actor").with_label("Monsters"))
        .await
        .expect("register pack")
}

async fn unlocked_monsters(world: &World) -> CompendiumCollection {
    let pack = monsters(world).await;
    pack.configure(&gm(), CompendiumConfiguration::locked(false))
        .await
        .expect("unlock");
    pack
}

#[tokio::test(start_paused = true)]
async fn cached_documents_expire_after_lifetime_without_access() {
    let backend = CountingBackend::in_memory();
    seed(&backend, 7).await;
    let world = world_with(&backend);
    let pack = monsters(&world).await;

    let first = pack.get_document(GOBLIN).await.expect("fetch");
    assert_eq!(backend.calls().gets, 1);

    tokio::time::advance(Duration::from_secs(200)).await;
    let second = pack.get_document(GOBLIN).await.expect("cache hit");
    assert!(second.ptr_eq(&first));
    assert_eq!(backend.calls().gets, 1);

    // Last access at 200s, so the entry lapses at 500s.
    tokio::time::advance(Duration::from_secs(400)).await;
    assert!(pack.get(GOBLIN).is_none());
    assert!(pack.documents().is_empty());
    assert!(pack.index_entry(GOBLIN).is_some());

    let third = pack.get_document(GOBLIN).await.expect("refetch");
    assert!(!third.ptr_eq(&first));
    assert_eq!(backend.calls().gets, 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_fetches_share_one_backend_read() {
    let backend = CountingBackend::in_memory();
    seed(&backend, 7).await;
    let world = world_with(&backend);
    let pack = monsters(&world).await;
    backend.delay_gets(Duration::from_millis(50));

    let (left, right) = tokio::join!(pack.get_document(GOBLIN), pack.get_document(GOBLIN));
    let left = left.expect("left fetch");
    let right = right.expect("right fetch");

    assert!(left.ptr_eq(&right));
    assert_eq!(backend.calls().gets, 1);
    assert_eq!(left.read().pack(), Some(MONSTERS));
    assert_eq!(left.read().derived().expect("prepared")["itemCount"], json!(1));
}

#[tokio::test]
async fn missing_documents_are_not_found_and_not_cached() {
    let backend = CountingBackend::in_memory();
    seed(&backend, 7).await;
    let world = world_with(&backend);
    let pack = monsters(&world).await;

    for attempt in 1..=2 {
        let err = pack
            .get_document("missing000000001")
            .await
            .expect_err("not stored");
        assert_eq!(err.code(), "not_found");
        assert_eq!(backend.calls().gets, attempt);
    }
}

#[tokio::test]
async fn index_is_filled_without_caching_documents() {
    let backend = CountingBackend::in_memory();
    seed(&backend, 7).await;
    let world = world_with(&backend);
    let pack = monsters(&world).await;

    let index = pack.get_index().await.expect("index");
    assert_eq!(
        index,
        vec![
            object(json!({"_id": GOBLIN, "name": "Goblin", "type": "npc"})),
            object(json!({"_id": ORC, "name": "Orc", "type": "npc"})),
        ]
    );
    assert!(pack.documents().is_empty());

    pack.get_document(ORC).await.expect("fetch");
    assert_eq!(pack.documents().len(), 1);
    assert_eq!(pack.index().len(), 2);
}

#[tokio::test]
async fn packs_of_other_packages_start_locked() {
    let backend = CountingBackend::in_memory();
    let world = world_with(&backend);
    let pack = monsters(&world).await;
    assert!(pack.locked());
    assert!(!pack.private());

    let loot = world
        .create_compendium(&gm(), "Loot", "Item")
        .await
        .expect("world pack");
    assert!(!loot.locked());
    assert_eq!(loot.collection(), "world.loot");
}

#[tokio::test]
async fn locked_pack_rejects_every_mutation_even_for_gamemasters() {
    let backend = CountingBackend::in_memory();
    seed(&backend, 7).await;
    let world = world_with(&backend);
    let pack = monsters(&world).await;
    let goblin = pack.get_document(GOBLIN).await.expect("reads are allowed");
    let hero = world
        .require_collection("Actor")
        .expect("actors")
        .create_documents(&gm(), vec![object(json!({"name": "Hero"}))], &ModificationOptions::default())
        .await
        .expect("world actor")
        .remove(0);
    let before = backend.calls();
    let options = ModificationOptions::default();
    let admin = gm();

    let results: Vec<DocumentError> = vec![
        pack.create_documents(&admin, vec![object(json!({"name": "Kobold"}))], &options)
            .await
            .expect_err("create"),
        pack.update_documents(&admin, vec![object(json!({"_id": GOBLIN, "hp": 1}))], &options)
            .await
            .expect_err("update"),
        pack.delete_documents(&admin, vec![ORC.to_string()], &options)
            .await
            .expect_err("delete"),
        pack.create_embedded_documents(&admin, GOBLIN, "items", vec![object(json!({"name": "Bow"}))], &options)
            .await
            .expect_err("embedded create"),
        pack.update_embedded_documents(
            &admin,
            GOBLIN,
            "items",
            vec![object(json!({"_id": "scimitar00000001", "weight": 1}))],
            &options,
        )
        .await
        .expect_err("embedded update"),
        pack.delete_embedded_documents(&admin, GOBLIN, "items", vec!["scimitar00000001".to_string()], &options)
            .await
            .expect_err("embedded delete"),
        pack.import_document(&admin, &hero).await.expect_err("import"),
        pack.import_all(&admin, &world, ImportAllOptions::default())
            .await
            .expect_err("import all"),
        pack.migrate(&admin, &options).await.expect_err("migrate"),
        pack.index_document(&admin, &goblin).expect_err("index"),
    ];
    for err in results {
        assert_eq!(err, DocumentError::LockedPack(MONSTERS.to_string()));
    }
    assert_eq!(backend.calls().writes(), before.writes());
    let held = pack.documents();
    assert_eq!(held.ids(), vec![GOBLIN.to_string()]);
    assert!(held.get(GOBLIN).is_some_and(|handle| handle.ptr_eq(&goblin)));
    assert_eq!(goblin.read().source()["hp"], json!(7));
    assert_eq!(goblin.read().embedded("items").len(), 1);
    let stored = backend
        .get_documents(&Scope::collection(MONSTERS), &Query::all())
        .await
        .expect("stored pack");
    assert_eq!(stored.len(), 2);

    pack.configure(&admin, CompendiumConfiguration::locked(false))
        .await
        .expect("configure works on locked packs");
    let created = pack
        .create_documents(&admin, vec![object(json!({"name": "Kobold"}))], &options)
        .await
        .expect("unlocked create");
    assert_eq!(created[0].read().pack(), Some(MONSTERS));
    assert!(pack.index_entry(created[0].id()).is_some());
}

#[tokio::test]
async fn players_cannot_modify_packs() {
    let backend = CountingBackend::in_memory();
    let world = world_with(&backend);
    let loot = world
        .create_compendium(&gm(), "Loot", "Item")
        .await
        .expect("world pack");
    let alice = player("alice");

    let err = loot
        .create_documents(&alice, vec![object(json!({"name": "Gem"}))], &ModificationOptions::default())
        .await
        .expect_err("players do not own packs");
    assert_eq!(err.code(), "permission");
    assert!(loot.visible_to(&alice));

    let err = loot
        .configure(&alice, CompendiumConfiguration::private(true))
        .await
        .expect_err("players cannot configure");
    assert_eq!(err.code(), "permission");

    loot.configure(&gm(), CompendiumConfiguration::private(true))
        .await
        .expect("gm configures");
    assert!(!loot.visible_to(&alice));
    assert!(loot.visible_to(&gm()));
}

#[tokio::test]
async fn configuration_is_stored_per_pack_and_reloaded() {
    let backend = CountingBackend::in_memory();
    let world = world_with(&backend);
    let pack = monsters(&world).await;
    let loot = world
        .create_compendium(&gm(), "Loot", "Item")
        .await
        .expect("world pack");

    pack.configure(&gm(), CompendiumConfiguration::locked(false))
        .await
        .expect("unlock monsters");
    loot.configure(&gm(), CompendiumConfiguration::private(true))
        .await
        .expect("hide loot");
    let merged = pack
        .configure(&gm(), CompendiumConfiguration::private(true))
        .await
        .expect("hide monsters");
    assert_eq!(
        merged,
        CompendiumConfiguration {
            private: Some(true),
            locked: Some(false)
        }
    );

    let stored = backend
        .get_setting(CONFIG_SETTING)
        .await
        .expect("read setting")
        .expect("setting written");
    assert_eq!(
        stored,
        json!({
            "dnd5e.monsters": {"private": true, "locked": false},
            "world.loot": {"private": true}
        })
    );

    let reopened = world_with(&backend);
    let pack = monsters(&reopened).await;
    assert!(!pack.locked());
    assert!(pack.private());
}

#[tokio::test]
async fn import_all_files_documents_under_a_new_folder() {
    let backend = CountingBackend::in_memory();
    seed(&backend, 7).await;
    let world = world_with(&backend);
    let pack = unlocked_monsters(&world).await;

    let imported = pack
        .import_all(
            &gm(),
            &world,
            ImportAllOptions {
                folder_name: Some("Monsters".to_string()),
                ..ImportAllOptions::default()
            },
        )
        .await
        .expect("import all");

    let folders = world.require_collection("Folder").expect("folders").contents();
    assert_eq!(folders.len(), 1);
    let folder = folders[0].read();
    assert_eq!(folder.name(), Some("Monsters"));
    assert_eq!(folder.source()["type"], json!("Actor"));

    assert_eq!(imported.len(), 2);
    let actors = world.require_collection("Actor").expect("actors");
    assert_eq!(actors.len(), 2);
    for handle in &imported {
        let document = handle.read();
        assert_eq!(document.source()["folder"], json!(folder.id()));
        assert_ne!(document.id(), GOBLIN);
        assert_ne!(document.id(), ORC);
        assert!(document.pack().is_none());
    }
    assert_eq!(imported[0].read().embedded("items").len(), 1);
}

#[tokio::test]
async fn import_document_copies_without_local_identity() {
    let backend = CountingBackend::in_memory();
    let world = world_with(&backend);
    let pack = unlocked_monsters(&world).await;
    let hero = world
        .require_collection("Actor")
        .expect("actors")
        .create_documents(
            &gm(),
            vec![object(json!({"name": "Hero", "permission": {"alice": 3}}))],
            &ModificationOptions::default(),
        )
        .await
        .expect("world actor")
        .remove(0);

    let copy = pack.import_document(&gm(), &hero).await.expect("import");
    assert_ne!(copy.id(), hero.id());
    assert!(!copy.read().source().contains_key("permission"));
    assert_eq!(pack.index_entry(copy.id()).expect("indexed")["name"], json!("Hero"));

    let loot = world
        .create_compendium(&gm(), "Loot", "Item")
        .await
        .expect("item pack");
    let err = loot.import_document(&gm(), &hero).await.expect_err("wrong type");
    assert_eq!(err.code(), "validation");
}

#[tokio::test]
async fn migrate_writes_nothing_when_any_document_is_invalid() {
    let backend = CountingBackend::in_memory();
    seed(&backend, -4).await;
    let world = world_with(&backend);
    let pack = unlocked_monsters(&world).await;
    let before = backend.calls();

    let err = pack
        .migrate(&gm(), &ModificationOptions::default())
        .await
        .expect_err("goblin has negative hp");
    assert_eq!(err.code(), "validation");
    assert_eq!(backend.calls().updates, before.updates);
}

#[tokio::test]
async fn migrate_rewrites_the_pack_and_drops_the_cache() {
    let backend = CountingBackend::in_memory();
    seed(&backend, 7).await;
    let world = world_with(&backend);
    let pack = unlocked_monsters(&world).await;
    pack.get_document(GOBLIN).await.expect("cache goblin");
    let before = backend.calls();

    let migrated = pack
        .migrate(&gm(), &ModificationOptions::default())
        .await
        .expect("migrate");

    assert!(migrated.ptr_eq(&pack));
    assert_eq!(backend.calls().updates, before.updates + 1);
    assert!(pack.documents().is_empty());
    assert_eq!(pack.index().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn sweep_skips_documents_being_mutated() {
    let backend = CountingBackend::in_memory();
    seed(&backend, 7).await;
    let world = world_with(&backend);
    let pack = unlocked_monsters(&world).await;
    let goblin = pack.get_document(GOBLIN).await.expect("fetch");

    backend.delay_writes(Duration::from_secs(1000));
    let update = tokio::spawn({
        let pack = pack.clone();
        async move {
            pack.update_documents(
                &gm(),
                vec![object(json!({"_id": GOBLIN, "hp": 9}))],
                &ModificationOptions::default(),
            )
            .await
        }
    });
    while !goblin.is_mutating() {
        tokio::task::yield_now().await;
    }

    tokio::time::advance(Duration::from_secs(301)).await;
    assert_eq!(pack.sweep_expired(), 0);
    assert!(pack.get(GOBLIN).is_some_and(|handle| handle.ptr_eq(&goblin)));

    update
        .await
        .expect("update task")
        .expect("update");
    assert_eq!(goblin.read().source()["hp"], json!(9));

    tokio::time::advance(Duration::from_secs(301)).await;
    assert_eq!(pack.sweep_expired(), 1);
    assert!(pack.documents().is_empty());
    assert!(pack.index_entry(GOBLIN).is_some());
}

#[tokio::test(start_paused = true)]
async fn background_sweeper_evicts_expired_documents() {
    let backend = CountingBackend::in_memory();
    seed(&backend, 7).await;
    let world = world_with(&backend).with_cache_config(
        PackCacheConfig::default()
            .with_lifetime(Duration::from_secs(60))
            .with_sweep_interval(Duration::from_secs(10)),
    );
    let pack = monsters(&world).await;
    pack.get_documents(&Query::all()).await.expect("load all");
    assert_eq!(pack.documents().len(), 2);

    tokio::time::sleep(Duration::from_secs(75)).await;
    assert!(pack.documents().is_empty());
    assert_eq!(pack.index().len(), 2);
}

#[tokio::test]
async fn malformed_stored_flags_keep_the_pack_locked_and_private() {
    let backend = CountingBackend::in_memory();
    backend
        .set_setting(
            CONFIG_SETTING,
            json!({"world.loot": {"locked": "yes", "private": true}}),
        )
        .await
        .expect("store setting");
    let world = world_with(&backend);
    let loot = world
        .register_pack(CompendiumMetadata::new("world", "loot", "Item"))
        .await
        .expect("register");

    assert!(loot.locked());
    assert!(loot.private());
    assert!(!loot.visible_to(&player("alice")));
    let err = loot
        .create_documents(&gm(), vec![object(json!({"name": "Gem"}))], &ModificationOptions::default())
        .await
        .expect_err("still locked");
    assert_eq!(err, DocumentError::LockedPack("world.loot".to_string()));

    loot.configure(&gm(), CompendiumConfiguration::locked(false))
        .await
        .expect("repair the entry");
    assert!(!loot.locked());
    let setting = backend
        .get_setting(CONFIG_SETTING)
        .await
        .expect("read setting")
        .expect("setting kept");
    assert_eq!(setting, json!({"world.loot": {"locked": false, "private": true}}));
}

#[tokio::test]
async fn configure_refuses_to_replace_a_setting_that_is_not_an_object() {
    let backend = CountingBackend::in_memory();
    backend
        .set_setting(CONFIG_SETTING, json!(["not", "an", "object"]))
        .await
        .expect("store setting");
    let world = world_with(&backend);
    let loot = world
        .register_pack(CompendiumMetadata::new("world", "loot", "Item"))
        .await
        .expect("register");
    assert!(loot.locked());
    assert!(loot.private());

    let err = loot
        .configure(&gm(), CompendiumConfiguration::private(false))
        .await
        .expect_err("setting is not an object");
    assert_eq!(err.code(), "backend");
    let setting = backend
        .get_setting(CONFIG_SETTING)
        .await
        .expect("read setting");
    assert_eq!(setting, Some(json!(["not", "an", "object"])));
}

#[tokio::test]
async fn documents_with_short_backend_ids_are_served() {
    let backend = CountingBackend::in_memory();
    backend
        .create_documents(
            &Scope::collection(MONSTERS),
            vec![object(json!({"_id": "abc", "name": "Kobold", "type": "npc"}))],
            &ModificationOptions::default(),
        )
        .await
        .expect("seed");
    let world = world_with(&backend);
    let pack = monsters(&world).await;

    let index = pack.get_index().await.expect("index");
    assert_eq!(index[0]["_id"], json!("abc"));
    let kobold = pack.get_document("abc").await.expect("short id");
    assert_eq!(kobold.id(), "abc");
    assert_eq!(kobold.read().name(), Some("Kobold"));
}
