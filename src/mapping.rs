//! Binding band members to hardware coordinates.
//!
//! A binding rewrites the band so that every mapped member fits its
//! coordinate's extent, puts a marker above the band and returns the
//! per-coordinate projection of the band's domain. Members whose value
//! range exceeds the extent are strip-mined first:
//!
//! ```text
//! Band [floor(e / ext)]        tile loop, stays sequential
//!   Mark "thread_marker"
//!     Band [e mod ext]         bound to the coordinate
//! ```

use crate::config::MappingCfg;
use crate::error::{MappingError, MappingResult};
use log::debug;
use poly_rs::{Band, MultiUnionPwAff, NodeId, Schedule, UnionPwAff, UnionSet};
use std::collections::{BTreeMap, BTreeSet};

pub const THREAD_MARKER: &str = "thread_marker";
pub const BLOCK_MARKER: &str = "block_marker";
pub const WARP_MARKER: &str = "warp_marker";
pub const SKIP_MARKER: &str = "skip";
pub const MAP_TO_WARP: &str = "map_to_warp";
pub const REDUCE_MARKER: &str = "reduce_marker";
pub const INSERT_SYNC: &str = "insert_sync";
pub const ATOMIC_MARKER: &str = "atomic_add";
pub const PRESERVE_MARKER: &str = "preserve_dimension";

/// Coordinate name to the projection of the mapped domain on it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mapping {
    coords: BTreeMap<String, UnionPwAff>,
}

impl Mapping {
    pub fn new() -> Self {
        Mapping::default()
    }

    pub fn insert(&mut self, coord: impl Into<String>, upa: UnionPwAff) {
        self.coords.insert(coord.into(), upa);
    }

    pub fn get(&self, coord: &str) -> Option<&UnionPwAff> {
        self.coords.get(coord)
    }

    pub fn contains(&self, coord: &str) -> bool {
        self.coords.contains_key(coord)
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &UnionPwAff)> {
        self.coords.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// True if any coordinate of `cfg` is bound.
    pub fn uses(&self, cfg: &MappingCfg) -> bool {
        cfg.iter().any(|(name, _)| self.contains(name))
    }

    /// Bind every unbound coordinate of `cfg` to 0 on `domain`, leaving
    /// out the coordinates in `keep_free`.
    pub fn fill_zero(&mut self, cfg: &MappingCfg, domain: &UnionSet, keep_free: &BTreeSet<String>) {
        for (name, _) in cfg.iter() {
            if !self.contains(name) && !keep_free.contains(name) {
                self.insert(name, UnionPwAff::constant_on(domain, 0));
            }
        }
    }
}

/// Result of [`bind_band`].
#[derive(Clone, Debug)]
pub struct MappedBand {
    /// Marker inserted above the bound band
    pub mark: NodeId,
    /// The bound band (keeps the id it had before binding)
    pub band: NodeId,
    pub mapping: Mapping,
}

/// Bind members of the band at `band` to coordinates of `cfg`.
///
/// `assignments` holds `(member, coordinate position)` pairs. Unassigned
/// members stay in the band unchanged. With `check_extent`, a member whose
/// value range is wider than its extent is strip-mined into a tile band
/// inserted above. The returned mapping only holds the assigned
/// coordinates.
pub fn bind_band(
    sch: &mut Schedule,
    band: NodeId,
    cfg: &MappingCfg,
    assignments: &[(usize, usize)],
    check_extent: bool,
    marker: &str,
) -> MappingResult<MappedBand> {
    let domain = sch.collect_domain(band);
    let original = sch.band(band)?.clone();

    let mut extents = Vec::with_capacity(assignments.len());
    for &(member, coord) in assignments {
        let (name, extent) = cfg
            .get_at(coord)
            .ok_or_else(|| MappingError::UnknownCoordinate(format!("#{}", coord)))?;
        let upa = original.member(member)?;
        let exceeds = check_extent
            && upa
                .value_range(&domain)
                .map_or(false, |(lo, hi)| hi - lo + 1 > extent);
        extents.push((member, name.to_string(), extent, exceeds));
    }

    // strip-mine the members that do not fit
    let mut tile_members = Vec::new();
    let mut tile_coincident = Vec::new();
    let mut point = original.schedule.members().to_vec();
    for (member, name, extent, exceeds) in &extents {
        if !exceeds {
            continue;
        }
        debug!(
            "Member {} of band {} exceeds {} = {}, tiling",
            member, band, name, extent
        );
        tile_members.push(point[*member].scale_down_floor(*extent)?);
        tile_coincident.push(original.member_get_coincident(*member));
        point[*member] = point[*member].modulo(*extent)?;
    }
    if !tile_members.is_empty() {
        sch.band_set_partial_schedule(band, MultiUnionPwAff::new(point.clone()))?;
        let tile = Band::new(
            MultiUnionPwAff::new(tile_members),
            original.permutable,
            tile_coincident,
        );
        sch.insert_band(band, tile);
    }

    let mark = sch.insert_mark(band, marker);
    let mut mapping = Mapping::new();
    for (member, name, extent, _) in &extents {
        let upa = point[*member].modulo(*extent)?.intersect_domain(&domain);
        mapping.insert(name.clone(), upa);
    }
    debug!("Bound band {} under {} to {:?}", band, marker, mapping.coords.keys());
    Ok(MappedBand {
        mark,
        band,
        mapping,
    })
}

/// Isolate members `[first, first + count)` of the band at `node` in a
/// band of their own and return its id. Leading members stay at `node`;
/// trailing members move below.
pub fn isolate_members(
    sch: &mut Schedule,
    node: NodeId,
    first: usize,
    count: usize,
) -> MappingResult<NodeId> {
    let n_member = sch.band(node)?.n_member();
    if first + count < n_member {
        sch.band_split(node, first + count)?;
    }
    if first > 0 {
        return Ok(sch.band_split(node, first)?);
    }
    Ok(node)
}

/// Zero projection of `domain` on every coordinate of `cfg`.
pub fn zero_mapping(cfg: &MappingCfg, domain: &UnionSet) -> Mapping {
    let mut mapping = Mapping::new();
    mapping.fill_zero(cfg, domain, &BTreeSet::new());
    mapping
}
