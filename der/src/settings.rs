//! Device settings loaded from local XML documents.
//!
//! Installers drop per-device XML files (DER capability, nameplate
//! ratings, device information) into a directory; [`device_settings`]
//! parses each one with the schema engine and files it in the device's
//! [`Settings`] bag by resource type. The directory walk is the only
//! filesystem surface the core consumes.

use crate::device::DeviceRegistry;
use sep2::{types, ParseError, Parser, SeObject};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("error reading settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed settings document: {0}")]
    Parse(#[from] ParseError),
}

/// Parsed settings resources, at most one per schema type.
#[derive(Default)]
pub struct Settings {
    objects: Vec<(u16, SeObject)>,
}

impl Settings {
    pub fn insert(&mut self, obj: SeObject) {
        match self.objects.iter_mut().find(|(ty, _)| *ty == obj.type_id()) {
            Some((_, existing)) => existing.replace(obj),
            None => self.objects.push((obj.type_id(), obj)),
        }
    }

    pub fn get(&self, ty: u16) -> Option<&SeObject> {
        self.objects.iter().find(|(t, _)| *t == ty).map(|(_, obj)| obj)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Apply `f` to every regular file in `dir`.
pub fn process_dir(
    dir: &Path,
    mut f: impl FnMut(&Path) -> Result<(), SettingsError>,
) -> Result<(), SettingsError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            f(&path)?;
        }
    }
    Ok(())
}

/// Parse one settings document into the bag.
pub fn load_settings(settings: &mut Settings, path: &Path) -> Result<(), SettingsError> {
    let data = fs::read(path)?;
    let doc = Parser::xml(types::schema(), &data).parse()?;
    log::debug!("load_settings: {} from {}", types::schema().se_name(doc.element), path.display());
    settings.insert(doc.object);
    Ok(())
}

/// Load the settings directory for one device.
pub fn device_settings(
    registry: &mut DeviceRegistry,
    sfdi: u64,
    dir: &Path,
) -> Result<(), SettingsError> {
    let device = registry.get_device(sfdi);
    process_dir(dir, |path| load_settings(&mut device.settings, path))
}
