/*
  Copyright© 2022 Raúl Wolters(1)

  This file is part of rustronomy-core.

  rustronomy is free software: you can redistribute it and/or modify it under
  the terms of the European Union Public License version 1.2 or later, as
  published by the European Commission.

  rustronomy is distributed in the hope that it will be useful, but WITHOUT ANY
  WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
  A PARTICULAR PURPOSE. See the European Union Public License for more details.

  You should have received a copy of the EUPL in an/all official language(s) of
  the European Union along with rustronomy.  If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

//! Global immersion tree builder: raise the water level over the whole image
//! at once by sweeping the pixels in sorted order and merging regions with a
//! union-find structure. O(N log N), dominated by the sort.

use std::cmp::Ordering;

use super::{Component, ComponentTree, PixelMap};

//Union-find over raster indices: flat parent vector with path compression,
//merges by rank. Only lives for the duration of one build.
struct UnionFind {
  parent: Vec<u32>,
  rank: Vec<u8>,
}

impl UnionFind {
  fn new(len: usize) -> Self {
    UnionFind { parent: (0..len as u32).collect(), rank: vec![0; len] }
  }

  fn find(&mut self, start: u32) -> u32 {
    //(i) walk up to the root
    let mut root = start;
    while self.parent[root as usize] != root {
      root = self.parent[root as usize];
    }
    //(ii) point everything on the path straight at the root
    let mut x = start;
    while self.parent[x as usize] != root {
      let next = self.parent[x as usize];
      self.parent[x as usize] = root;
      x = next;
    }
    root
  }

  /// Merges the sets rooted at `a` and `b` (both must be roots) and returns
  /// the root of the merged set.
  fn union(&mut self, a: u32, b: u32) -> u32 {
    match self.rank[a as usize].cmp(&self.rank[b as usize]) {
      Ordering::Less => {
        self.parent[a as usize] = b;
        b
      }
      Ordering::Greater => {
        self.parent[b as usize] = a;
        a
      }
      Ordering::Equal => {
        self.parent[b as usize] = a;
        self.rank[a as usize] += 1;
        a
      }
    }
  }
}

//Arena slot during construction. Local pixels are kept as raster indices and
//only decoded into coordinates once the surviving slots are compacted.
struct Open {
  level: u8,
  local: Vec<u32>,
  size: usize,
  parent: Option<usize>,
  children: Vec<usize>,
  alive: bool,
}

/// Attaches the lower-level component `low` as a child of `high`.
fn attach(arena: &mut [Open], high: usize, low: usize) -> usize {
  let low_size = arena[low].size;
  arena[low].parent = Some(high);
  arena[high].children.push(low);
  arena[high].size += low_size;
  high
}

/// Fuses two components at the same grey level into one. The larger slot
/// survives, ties keep the older one; the other slot is tombstoned and its
/// pixels and children move over.
fn absorb(arena: &mut [Open], a: usize, b: usize) -> usize {
  let (keep, dead) = match arena[a].size.cmp(&arena[b].size) {
    Ordering::Greater => (a, b),
    Ordering::Less => (b, a),
    Ordering::Equal => (a.min(b), a.max(b)),
  };
  let mut local = std::mem::take(&mut arena[dead].local);
  let mut children = std::mem::take(&mut arena[dead].children);
  let dead_size = arena[dead].size;
  arena[dead].alive = false;
  for &ch in &children {
    arena[ch].parent = Some(keep);
  }
  arena[keep].local.append(&mut local);
  arena[keep].children.append(&mut children);
  arena[keep].size += dead_size;
  keep
}

pub(super) fn build(map: &PixelMap) -> ComponentTree {
  let len = map.len();

  //(1) sort raster indices by grey value, ties by raster position
  let mut order: Vec<u32> = (0..len as u32).collect();
  order.sort_unstable_by_key(|&i| (map.value(i), i));

  #[cfg(feature = "progress")]
  let bar = crate::set_up_bar("immersing pixel", len as u64);

  //(2) sweep the sorted pixels, keeping one open component per pixel set
  let mut uf = UnionFind::new(len);
  let mut arena: Vec<Open> = Vec::with_capacity(len);
  //per union-find root: arena slot of the open component of that set
  let mut comp_of: Vec<u32> = vec![0; len];

  for (_n, &p) in order.iter().enumerate() {
    let vp = map.value(p);
    arena.push(Open {
      level: vp,
      local: vec![p],
      size: 1,
      parent: None,
      children: Vec::new(),
      alive: true,
    });
    comp_of[p as usize] = (arena.len() - 1) as u32;

    for dir in 0..4u8 {
      let q = match map.neighbour(p, dir) {
        Some(q) => q,
        None => continue,
      };
      //only neighbours that the sweep has already passed take part
      let vq = map.value(q);
      if (vq, q) >= (vp, p) {
        continue;
      }
      let rp = uf.find(p);
      let rq = uf.find(q);
      if rp == rq {
        continue;
      }
      let cp = comp_of[rp as usize] as usize;
      let cq = comp_of[rq as usize] as usize;
      //the open component of p's set always sits at the sweep level, the
      //neighbour's at most there: same level fuses, lower level nests
      let survivor = if arena[cq].level == arena[cp].level {
        absorb(&mut arena, cp, cq)
      } else {
        attach(&mut arena, cp, cq)
      };
      let root = uf.union(rp, rq);
      comp_of[root as usize] = survivor as u32;
    }

    #[cfg(feature = "progress")]
    if _n & 0xfff == 0 {
      bar.set_position(_n as u64);
    }
  }

  #[cfg(feature = "progress")]
  bar.finish();

  //(3) compact the arena: drop tombstones, remap links, record pixel owners
  let root_raw = comp_of[uf.find(0) as usize] as usize;
  let mut new_idx = vec![usize::MAX; arena.len()];
  let mut n_alive = 0usize;
  for (i, open) in arena.iter().enumerate() {
    if open.alive {
      new_idx[i] = n_alive;
      n_alive += 1;
    }
  }

  let mut components = Vec::with_capacity(n_alive);
  let mut owners = vec![0u32; len];
  for (i, open) in arena.into_iter().enumerate() {
    if !open.alive {
      continue;
    }
    let idx = new_idx[i];
    let mut comp = Component::new(open.level);
    comp.size = open.size;
    comp.parent = open.parent.map(|p| new_idx[p]);
    comp.children = open.children.into_iter().map(|ch| new_idx[ch]).collect();
    comp.local = open.local.iter().map(|&px| map.pixel(px)).collect();
    for &px in &open.local {
      owners[px as usize] = idx as u32;
    }
    components.push(comp);
  }

  ComponentTree::from_parts(components, new_idx[root_raw], owners, map.width(), map.height())
}
