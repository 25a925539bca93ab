//! ELF loading and symbolization backing [`crate::replay::SymbolResolver`],
//! grounded on `samply-symbols::external_file`'s `object::File::parse` plus
//! `ObjectSymbol` usage.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSymbol};
use rustc_hash::FxHashMap;

use crate::error::{ReconstructError, Result};
use crate::replay::{ModuleId, SymbolId, SymbolResolver};
use crate::sideband::SidebandModel;

struct LoadedImage {
    mmap: Mmap,
    symbols: Vec<(u64, String)>,
}

impl LoadedImage {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| ReconstructError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| ReconstructError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut symbols = Vec::new();
        if let Ok(object) = object::File::parse(&mmap[..]) {
            for symbol in object.symbols() {
                if let Ok(name) = symbol.name() {
                    symbols.push((symbol.address(), name.to_string()));
                }
            }
            symbols.sort_by_key(|(addr, _)| *addr);
        }
        Ok(LoadedImage { mmap, symbols })
    }

    fn symbol_name_at(&self, addr: u64) -> Option<&str> {
        let idx = self.symbols.partition_point(|(a, _)| *a <= addr);
        self.symbols.get(idx.checked_sub(1)?).map(|(_, n)| n.as_str())
    }

    fn symbol_address(&self, name: &str) -> Option<u64> {
        self.symbols.iter().find(|(_, n)| n == name).map(|(a, _)| *a)
    }

    fn bytes_at_file_offset(&self, load_start: u64, addr: u64, len: usize) -> Option<Vec<u8>> {
        let object = object::File::parse(&self.mmap[..]).ok()?;
        let svma = addr.checked_sub(load_start)?;
        let section = object
            .sections()
            .find(|s| (s.address()..s.address() + s.size()).contains(&svma))?;
        let data = section.data().ok()?;
        let within = (svma - section.address()) as usize;
        let end = (within + len).min(data.len());
        (within < data.len()).then(|| data[within..end].to_vec())
    }
}

/// Resolves replay addresses against the binaries the sideband model's
/// process histories map in, caching one [`LoadedImage`] per target path.
pub struct ElfResolver<'a> {
    sideband: &'a SidebandModel,
    images: FxHashMap<PathBuf, LoadedImage>,
    module_ids: FxHashMap<PathBuf, ModuleId>,
    module_paths: Vec<PathBuf>,
    module_is_host: Vec<bool>,
    symbol_ids: FxHashMap<(ModuleId, u64), SymbolId>,
    symbol_names: Vec<String>,
    target_roots: Vec<PathBuf>,
}

impl<'a> ElfResolver<'a> {
    pub fn new(sideband: &'a SidebandModel, target_roots: Vec<PathBuf>) -> Self {
        ElfResolver {
            sideband,
            images: FxHashMap::default(),
            module_ids: FxHashMap::default(),
            module_paths: Vec::new(),
            module_is_host: Vec::new(),
            symbol_ids: FxHashMap::default(),
            symbol_names: Vec::new(),
            target_roots,
        }
    }

    pub fn module_paths(&self) -> &[PathBuf] {
        &self.module_paths
    }

    /// Whether a module was resolved directly from its mapped path rather
    /// than rewritten under one of `-t`'s target roots (`-h` vs `-e`).
    pub fn module_is_host(&self, module: ModuleId) -> bool {
        self.module_is_host.get(module as usize).copied().unwrap_or(true)
    }

    pub fn symbol_names(&self) -> &[String] {
        &self.symbol_names
    }

    fn resolved_path(&self, mapped_path: &str) -> (PathBuf, bool) {
        for root in &self.target_roots {
            let candidate = root.join(mapped_path.trim_start_matches('/'));
            if candidate.exists() {
                return (candidate, false);
            }
        }
        (PathBuf::from(mapped_path), true)
    }

    fn load(&mut self, path: &Path) -> Option<&LoadedImage> {
        if !self.images.contains_key(path) {
            let image = LoadedImage::open(path).ok()?;
            self.images.insert(path.to_path_buf(), image);
        }
        self.images.get(path)
    }

    fn module_id_for(&mut self, path: &Path, is_host: bool) -> ModuleId {
        if let Some(&id) = self.module_ids.get(path) {
            return id;
        }
        let id = self.module_paths.len() as ModuleId;
        self.module_paths.push(path.to_path_buf());
        self.module_is_host.push(is_host);
        self.module_ids.insert(path.to_path_buf(), id);
        id
    }

    fn mapping(&self, tid: u32, addr: u64, tsc: u64) -> Option<(PathBuf, bool, u64)> {
        let (mapped_path, load_start) = self.sideband.lookup_mapping(tid, addr, tsc)?;
        let (path, is_host) = self.resolved_path(&mapped_path);
        Some((path, is_host, load_start))
    }
}

impl SymbolResolver for ElfResolver<'_> {
    fn module_for(&mut self, tid: u32, addr: u64, tsc: u64) -> Option<ModuleId> {
        let (path, is_host, _) = self.mapping(tid, addr, tsc)?;
        self.load(&path)?;
        Some(self.module_id_for(&path, is_host))
    }

    fn bytes_at(&mut self, tid: u32, addr: u64, tsc: u64, max_len: usize) -> Option<Vec<u8>> {
        let (path, _, load_start) = self.mapping(tid, addr, tsc)?;
        let image = self.load(&path)?;
        image.bytes_at_file_offset(load_start, addr, max_len)
    }

    fn symbol_id(&mut self, module: ModuleId, addr: u64) -> SymbolId {
        if let Some(&id) = self.symbol_ids.get(&(module, addr)) {
            return id;
        }
        let path = self.module_paths[module as usize].clone();
        let name = self
            .images
            .get(&path)
            .and_then(|img| img.symbol_name_at(addr))
            .map(str::to_string)
            .unwrap_or_else(|| format!("{path}+{addr:#x}", path = path.display()));
        let id = self.symbol_names.len() as SymbolId;
        self.symbol_names.push(name);
        self.symbol_ids.insert((module, addr), id);
        id
    }

    fn resolve_relocation(&mut self, tid: u32, tsc: u64, name: &str) -> Option<u64> {
        for path in self.sideband.process_for_tid(tid)?.mapped_paths_as_of(tsc) {
            let (resolved, _) = self.resolved_path(&path);
            if let Some(image) = self.load(&resolved) {
                if let Some(addr) = image.symbol_address(name) {
                    return Some(addr);
                }
            }
        }
        None
    }

    fn relocation_name_at(&mut self, module: ModuleId, addr: u64) -> Option<String> {
        let path = self.module_paths.get(module as usize)?.clone();
        self.images.get(&path)?.symbol_name_at(addr).map(str::to_string)
    }
}
