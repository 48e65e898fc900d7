//! Kernel source generation.
//!
//! Grid extents, the number of materials and the number of poles are baked
//! into the kernels as constants, so a shader module is specific to a
//! [`KernelKey`]. Modules are cached as long as some solver instance uses
//! them.

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        Arc,
        Weak,
    },
};

use parking_lot::Mutex;

const COMMON: &str = include_str!("kernels/common.wgsl");
const UPDATE: &str = include_str!("kernels/update.wgsl");
const SOURCES: &str = include_str!("kernels/sources.wgsl");
const PML: &str = include_str!("kernels/pml.wgsl");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum KernelKind {
    Update,
    Sources,
    Pml,
}

impl KernelKind {
    fn template(&self) -> &'static str {
        match self {
            KernelKind::Update => UPDATE,
            KernelKind::Sources => SOURCES,
            KernelKind::Pml => PML,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub kind: KernelKind,
    /// Node extents `(nx+1, ny+1, nz+1)`.
    pub nodes: [u32; 3],
    pub num_materials: u32,
    pub poles: u32,
}

impl KernelKey {
    pub fn num_nodes(&self) -> u32 {
        self.nodes.iter().product()
    }

    /// Full WGSL source of the module.
    pub fn source(&self) -> String {
        let template = format!("{COMMON}\n{}", self.kind.template());
        render(
            &template,
            &[
                ("NX", self.nodes[0]),
                ("NY", self.nodes[1]),
                ("NZ", self.nodes[2]),
                ("NUM_NODES", self.num_nodes()),
                // a zero-sized array is not valid WGSL
                ("NUM_MATERIALS", self.num_materials.max(1)),
                ("POLES", self.poles),
            ],
        )
    }

    fn label(&self) -> String {
        let [nx, ny, nz] = self.nodes;
        format!(
            "gpr-fdtd/{}/{nx}x{ny}x{nz}/m{}/p{}",
            self.kind, self.num_materials, self.poles
        )
    }
}

/// Replaces every `{{NAME}}` in `template` by its value.
fn render(template: &str, substitutions: &[(&str, u32)]) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}")
        else {
            break;
        };
        output.push_str(&rest[..start]);
        let name = &after[..end];
        match substitutions.iter().find(|(key, _)| *key == name) {
            Some((_, value)) => output.push_str(&value.to_string()),
            None => {
                tracing::warn!(name, "unknown kernel template parameter");
                output.push_str(&rest[start..start + 2 + end + 2]);
            }
        }
        rest = &after[end + 2..];
    }

    output.push_str(rest);
    output
}

#[derive(Debug, Default)]
pub struct ShaderCache {
    modules: Mutex<ModuleTable<wgpu::ShaderModule>>,
}

impl ShaderCache {
    pub fn get(&self, device: &wgpu::Device, key: KernelKey) -> Arc<wgpu::ShaderModule> {
        self.modules.lock().get_or_compile(key, |key| {
            let label = key.label();
            tracing::debug!(%label, "compiling kernel");
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&label),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(key.source())),
            })
        })
    }

    /// Number of modules still used by some solver instance.
    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compiled modules by kernel key. Holds only weak references, so a module is
/// dropped with the last instance using it.
#[derive(Debug)]
struct ModuleTable<M> {
    modules: HashMap<KernelKey, Weak<M>>,
}

impl<M> Default for ModuleTable<M> {
    fn default() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }
}

impl<M> ModuleTable<M> {
    fn get_or_compile(
        &mut self,
        key: KernelKey,
        compile: impl FnOnce(&KernelKey) -> M,
    ) -> Arc<M> {
        if let Some(module) = self.modules.get(&key).and_then(Weak::upgrade) {
            return module;
        }

        // Modules for grids that are gone.
        self.modules.retain(|_, module| module.strong_count() > 0);

        let module = Arc::new(compile(&key));
        self.modules.insert(key, Arc::downgrade(&module));
        module
    }

    fn len(&self) -> usize {
        self.modules
            .values()
            .filter(|module| module.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        KernelKey,
        KernelKind,
        ModuleTable,
        render,
    };

    #[test]
    fn substitutes_known_parameters() {
        let output = render("const A: u32 = {{A}}u; // {{B}} {{", &[("A", 42)]);
        assert_eq!(output, "const A: u32 = 42u; // {{B}} {{");
    }

    #[test]
    fn kernel_sources_are_fully_rendered() {
        for kind in [KernelKind::Update, KernelKind::Sources, KernelKind::Pml] {
            let key = KernelKey {
                kind,
                nodes: [11, 12, 13],
                num_materials: 3,
                poles: 2,
            };
            let source = key.source();
            assert!(!source.contains("{{"), "{kind}");
            assert!(source.contains("const NUM_NODES: u32 = 1716u;"));
            assert!(source.contains("const NUM_MATERIALS: u32 = 3u;"));
            assert!(source.contains("const POLES: u32 = 2u;"));
        }
    }

    #[test]
    fn keys_differ_by_shape() {
        let key = KernelKey {
            kind: KernelKind::Update,
            nodes: [11, 11, 11],
            num_materials: 2,
            poles: 0,
        };
        let other = KernelKey {
            poles: 1,
            ..key
        };
        assert_ne!(key, other);
        assert_ne!(key.label(), other.label());
    }

    #[test]
    fn modules_are_shared_while_in_use() {
        let key = KernelKey {
            kind: KernelKind::Pml,
            nodes: [5, 5, 5],
            num_materials: 2,
            poles: 0,
        };
        let mut table = ModuleTable::default();
        let first = table.get_or_compile(key, |key| key.label());
        let second = table.get_or_compile(key, |_| unreachable!("compiled twice"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);

        drop((first, second));
        assert_eq!(table.len(), 0);

        let other = KernelKey {
            poles: 1,
            ..key
        };
        let _module = table.get_or_compile(other, |key| key.label());
        assert_eq!(table.modules.len(), 1);
        assert!(table.modules.contains_key(&other));
    }
}
