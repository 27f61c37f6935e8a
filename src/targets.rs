//! The render target table: the wiring substrate between pass modules.
//!
//! Every offscreen image a pass writes or reads is registered here under a
//! logical name ("depth", "normal", "composition", ...). The table is mutated
//! only during setup and resize; at record time it is a lookup structure, and
//! a pass must never read a target before its producer has completed and
//! transitioned it to a read layout; the frame graph derives its ordering
//! edges from these names.
//!
//! A name can also be an *alias* for another entry. The renderer aliases the
//! output of a disabled chain stage to that stage's input, so downstream
//! passes resolve to the last enabled producer without special-casing.

use std::collections::HashMap;

use anyhow::Result;
use ash::vk;

use crate::core::error::Error;
use crate::core::DeviceContext;
use crate::resource::image::{Image, ImageCreateInfo};

enum Entry {
    Image(Image),
    Alias(String),
}

/// Name-keyed table of render target images.
#[derive(Default)]
pub struct RenderTargetTable {
    entries: HashMap<String, Entry>,
}

impl std::fmt::Debug for RenderTargetTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.entries.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("RenderTargetTable").field("targets", &names).finish()
    }
}

impl RenderTargetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image under a logical name, replacing any previous entry.
    pub fn put(&mut self, name: impl Into<String>, image: Image) {
        self.entries.insert(name.into(), Entry::Image(image));
    }

    /// Register `name` as an alias of `target`. One level of indirection only;
    /// aliasing an alias re-resolves at insertion time.
    pub fn put_alias(&mut self, name: impl Into<String>, target: &str) {
        let resolved = self.resolve(target);
        self.entries.insert(name.into(), Entry::Alias(resolved));
    }

    /// Resolve a name through at most one alias level to the name of the
    /// backing image entry.
    pub fn resolve(&self, name: &str) -> String {
        match self.entries.get(name) {
            Some(Entry::Alias(target)) => target.clone(),
            _ => name.to_owned(),
        }
    }

    /// Look up a target.
    /// # Errors
    /// [`Error::NoTargetBound`] if nothing was registered under the name.
    pub fn get(&self, name: &str) -> Result<&Image> {
        let resolved = self.resolve(name);
        match self.entries.get(&resolved) {
            Some(Entry::Image(image)) => Ok(image),
            _ => Err(Error::NoTargetBound(name.to_owned()).into()),
        }
    }

    /// Mutable lookup, used by passes that transition a target's layout while
    /// recording.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Image> {
        let resolved = self.resolve(name);
        match self.entries.get_mut(&resolved) {
            Some(Entry::Image(image)) => Ok(image),
            _ => Err(Error::NoTargetBound(name.to_owned()).into()),
        }
    }

    /// Remove every entry. Called on resize before the table is rebuilt.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The standard target set for the deferred pipeline, with the formats each
/// target carries.
pub const STANDARD_TARGETS: &[(&str, vk::Format)] = &[
    ("normal", vk::Format::R16G16B16A16_SFLOAT),
    ("albedo", vk::Format::R8G8B8A8_UNORM),
    // Specular/roughness/metallic.
    ("material", vk::Format::R8G8B8A8_UNORM),
    ("velocity", vk::Format::R16G16_SFLOAT),
    ("ssao", vk::Format::R16_SFLOAT),
    ("ssao_blur", vk::Format::R16_SFLOAT),
    ("ssr", vk::Format::R8G8B8A8_UNORM),
    ("composition", vk::Format::R8G8B8A8_UNORM),
    ("composition2", vk::Format::R8G8B8A8_UNORM),
    ("bright_filter", vk::Format::R8G8B8A8_UNORM),
    ("blur_h", vk::Format::R8G8B8A8_UNORM),
    ("blur_v", vk::Format::R8G8B8A8_UNORM),
    ("bloom", vk::Format::R8G8B8A8_UNORM),
    ("motion_blur", vk::Format::R8G8B8A8_UNORM),
    ("dof", vk::Format::R8G8B8A8_UNORM),
];

/// Format of the sampled depth attachment.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Build the standard render target table at the given viewport size.
///
/// Called at init and again on every resize; allocation failure here is fatal
/// and propagates.
pub fn create_standard_targets(
    ctx: &DeviceContext,
    width: u32,
    height: u32,
) -> Result<RenderTargetTable> {
    let mut table = RenderTargetTable::new();
    for &(name, format) in STANDARD_TARGETS {
        let image = Image::new(ctx, ImageCreateInfo::render_target(width, height, format))?;
        table.put(name, image);
    }
    table.put(
        "depth",
        Image::new(ctx, ImageCreateInfo::depth_target(width, height, DEPTH_FORMAT))?,
    );
    debug!("Created {} render targets at {width}x{height}", STANDARD_TARGETS.len() + 1);
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_target_is_an_error() {
        let table = RenderTargetTable::new();
        let err = table.get("composition").unwrap_err();
        let err = err.downcast_ref::<Error>().unwrap();
        assert!(matches!(err, Error::NoTargetBound(name) if name == "composition"));
    }

    #[test]
    fn alias_resolves_to_backing_name() {
        let mut table = RenderTargetTable::new();
        table.put_alias("bloom", "composition");
        assert_eq!(table.resolve("bloom"), "composition");
        // Aliasing an alias flattens to the original name.
        table.put_alias("motion_blur", "bloom");
        assert_eq!(table.resolve("motion_blur"), "composition");
        assert_eq!(table.resolve("composition"), "composition");
    }
}
