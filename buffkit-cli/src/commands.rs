//! Command implementations.

use anyhow::{bail, Context};
use buffkit::config::Config;
use buffkit::importmap::ImportMapManager;
use buffkit::jobs::Scheduler;
use buffkit::migrate::{create_scaffold, MigrationRunner};

async fn migration_runner(config: &Config) -> anyhow::Result<MigrationRunner> {
    let db = config
        .database
        .as_ref()
        .context("database is not configured (set database.url)")?;
    let pool = buffkit::database::create_pool(db).await?;
    Ok(MigrationRunner::new(pool, db.migrations_dir.clone()))
}

pub async fn migrate(config: &Config) -> anyhow::Result<()> {
    let runner = migration_runner(config).await?;
    let bootstrapped = runner.bootstrap().await?;
    if bootstrapped > 0 {
        println!("applied {bootstrapped} framework migration(s)");
    }
    let applied = runner.migrate().await?;
    if applied.is_empty() {
        println!("nothing to migrate");
    } else {
        for version in applied {
            println!("applied {version}");
        }
    }
    Ok(())
}

pub async fn migrate_status(config: &Config) -> anyhow::Result<()> {
    let runner = migration_runner(config).await?;
    for status in runner.status().await? {
        let marker = if status.applied { "applied" } else { "pending" };
        println!("{marker}  {}", status.version);
    }
    Ok(())
}

pub async fn migrate_down(config: &Config, n: usize) -> anyhow::Result<()> {
    if n == 0 {
        bail!("nothing to roll back (N must be at least 1)");
    }
    let runner = migration_runner(config).await?;
    let rolled_back = runner.rollback(n).await?;
    if rolled_back.is_empty() {
        println!("nothing to roll back");
    }
    for version in rolled_back {
        println!("rolled back {version}");
    }
    Ok(())
}

pub fn migrate_create(config: &Config, name: &str) -> anyhow::Result<()> {
    let dir = config
        .database
        .as_ref()
        .map(|db| db.migrations_dir.clone())
        .unwrap_or_else(|| "migrations".into());
    let version = create_scaffold(&dir, name)?;
    println!("created {}/{version}.up.sql", dir.display());
    println!("created {}/{version}.down.sql", dir.display());
    Ok(())
}

pub async fn jobs_worker(config: Config, concurrency: Option<usize>) -> anyhow::Result<()> {
    let (_app, kit) = buffkit::wire(axum::Router::new(), config).await?;
    kit.jobs.start(concurrency.unwrap_or(0));
    println!("workers running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    kit.shutdown().await;
    Ok(())
}

pub async fn jobs_scheduler(config: Config) -> anyhow::Result<()> {
    let (_app, kit) = buffkit::wire(axum::Router::new(), config).await?;
    let mut scheduler = Scheduler::new(kit.jobs_client());
    scheduler.register_standard()?;
    for kind in scheduler.kinds() {
        println!("scheduled {kind}");
    }

    let cancel = scheduler.cancel_token();
    let handle = tokio::spawn(scheduler.run());
    println!("scheduler running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    let _ = handle.await;
    kit.shutdown().await;
    Ok(())
}

pub async fn jobs_stats(config: Config) -> anyhow::Result<()> {
    let (_app, kit) = buffkit::wire(axum::Router::new(), config).await?;
    let stats = kit.jobs.stats().await?;

    println!("pending:");
    let mut pending: Vec<_> = stats.pending.iter().collect();
    pending.sort();
    for (queue, count) in pending {
        println!("  {queue}: {count}");
    }
    println!("scheduled: {}", stats.scheduled);
    println!("completed:");
    let mut completed: Vec<_> = stats.completed.iter().collect();
    completed.sort();
    for (queue, count) in completed {
        println!("  {queue}: {count}");
    }
    println!("dead-lettered: {}", stats.dead);

    kit.shutdown().await;
    Ok(())
}

pub async fn importmap_pin(
    config: &Config,
    name: &str,
    url: &str,
    download: bool,
) -> anyhow::Result<()> {
    let manager = ImportMapManager::load(config.importmap.clone())?;
    if download {
        let pin = manager.pin_vendored(name, url).await?;
        println!(
            "pinned {name} -> {} ({})",
            pin.path.as_deref().unwrap_or(url),
            pin.integrity.as_deref().unwrap_or("no integrity")
        );
    } else {
        manager.pin(name, url)?;
        println!("pinned {name} -> {url}");
    }
    Ok(())
}

pub fn importmap_unpin(config: &Config, name: &str) -> anyhow::Result<()> {
    let manager = ImportMapManager::load(config.importmap.clone())?;
    if manager.unpin(name)? {
        println!("unpinned {name}");
    } else {
        bail!("no pin named '{name}'");
    }
    Ok(())
}

pub async fn importmap_vendor(config: &Config) -> anyhow::Result<()> {
    let manager = ImportMapManager::load(config.importmap.clone())?;
    let vendored = manager.vendor_all().await?;
    println!("vendored {vendored} module(s)");
    Ok(())
}

pub async fn importmap_update(config: &Config) -> anyhow::Result<()> {
    let manager = ImportMapManager::load(config.importmap.clone())?;
    let updated = manager.update_all().await?;
    println!("updated {updated} module(s)");
    Ok(())
}

pub fn importmap_list(config: &Config) -> anyhow::Result<()> {
    let manager = ImportMapManager::load(config.importmap.clone())?;
    let pins = manager.list();
    if pins.is_empty() {
        println!("no pins");
        return Ok(());
    }
    for (name, pin) in pins {
        match (&pin.path, &pin.integrity) {
            (Some(path), Some(integrity)) => {
                println!("{name}  {}  (vendored: {path}, {integrity})", pin.url);
            }
            _ => println!("{name}  {}", pin.url),
        }
    }
    Ok(())
}
