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

//! Linear-time tree builder: flood downhill from a single source, shelving
//! higher ground on one FIFO queue per grey level and folding finished
//! regions together on a stack of open components. O(N) for 8-bit data.

use std::collections::VecDeque;

use super::{Component, ComponentTree, PixelMap, TreeError};

//Passing this as the new water level closes every open component
const CLOSE_ALL: i32 = 256;

//A component that the flood has not yet sealed. Children are indices of
//already-emitted components; their parent link is written at emission time.
struct Open {
  level: i32,
  local: Vec<u32>,
  size: usize,
  children: Vec<usize>,
}

impl Open {
  fn new(level: i32) -> Self {
    Open { level, local: Vec::new(), size: 0, children: Vec::new() }
  }
}

/// Moves a finished open component into the arena and wires up its children.
fn emit(open: Open, components: &mut Vec<Component>, owners: &mut [u32], map: &PixelMap) -> usize {
  let idx = components.len();
  let mut comp = Component::new(open.level as u8);
  comp.size = open.size;
  comp.local = open.local.iter().map(|&px| map.pixel(px)).collect();
  for &px in &open.local {
    owners[px as usize] = idx as u32;
  }
  for &ch in &open.children {
    components[ch].parent = Some(idx);
  }
  comp.children = open.children;
  components.push(comp);
  idx
}

/// Seals every open component below `new_level` and nests it into the next
/// one up, inserting an intermediate component when the stack skips the
/// target level.
fn process_stack(
  new_level: i32,
  stack: &mut Vec<Open>,
  components: &mut Vec<Component>,
  owners: &mut [u32],
  map: &PixelMap,
) {
  while stack.last().map_or(false, |top| new_level > top.level) {
    let closed = match stack.pop() {
      Some(c) => c,
      None => break,
    };
    let closed_size = closed.size;
    let idx = emit(closed, components, owners, map);
    if new_level < CLOSE_ALL {
      if stack.last().map_or(true, |top| new_level < top.level) {
        stack.push(Open::new(new_level));
      }
      if let Some(top) = stack.last_mut() {
        top.children.push(idx);
        top.size += closed_size;
      }
    }
  }
}

/// First shelved pixel at the lowest non-empty grey level. Scanning may
/// start at `from`: the flood never shelves a pixel below the level it has
/// just finished.
fn pop_lowest(boundary: &mut [VecDeque<u32>], from: u8) -> Option<u32> {
  for level in from as usize..boundary.len() {
    if let Some(q) = boundary[level].pop_front() {
      return Some(q);
    }
  }
  None
}

pub(super) fn build(map: &PixelMap) -> Result<ComponentTree, TreeError> {
  let len = map.len();
  let mut visited = vec![false; len];
  //per-pixel cursor into the neighbour table, so a shelved pixel resumes
  //scanning where it stopped instead of rescanning all four directions
  let mut dirs = vec![0u8; len];
  let mut boundary: Vec<VecDeque<u32>> = vec![VecDeque::new(); 256];
  let mut stack: Vec<Open> = Vec::new();
  let mut components: Vec<Component> = Vec::new();
  let mut owners = vec![0u32; len];

  #[cfg(feature = "progress")]
  let bar = crate::set_up_bar("flooding pixel", len as u64);
  let mut _done = 0usize;

  //the flood starts at the raster origin, not at a global minimum; the
  //stack processing sorts out whatever basin structure it runs into
  let mut p: u32 = 0;
  visited[0] = true;
  stack.push(Open::new(map.value(p) as i32));

  'flood: loop {
    let vp = map.value(p);

    //(1) look at the remaining unvisited neighbours of p
    while dirs[p as usize] < 4 {
      let dir = dirs[p as usize];
      dirs[p as usize] += 1;
      let n = match map.neighbour(p, dir) {
        Some(n) => n,
        None => continue,
      };
      if visited[n as usize] {
        continue;
      }
      visited[n as usize] = true;
      let vn = map.value(n);
      if vn >= vp {
        boundary[vn as usize].push_back(n);
      } else {
        //lower ground found: shelve p and pour into the neighbour first
        boundary[vp as usize].push_back(p);
        stack.push(Open::new(vn as i32));
        p = n;
        continue 'flood;
      }
    }

    //(2) every neighbour is accounted for: p settles in the open component
    //on top of the stack, whose level always equals vp here
    if let Some(top) = stack.last_mut() {
      top.local.push(p);
      top.size += 1;
    }
    _done += 1;
    #[cfg(feature = "progress")]
    if _done & 0xfff == 0 {
      bar.set_position(_done as u64);
    }

    //(3) fetch the lowest shelved pixel; rising water seals the stack up
    //to the new level
    let q = match pop_lowest(&mut boundary, vp) {
      Some(q) => q,
      None => break 'flood,
    };
    let vq = map.value(q);
    if vq > vp {
      process_stack(vq as i32, &mut stack, &mut components, &mut owners, map);
    }
    p = q;
  }

  #[cfg(feature = "progress")]
  bar.finish();

  //a correct flood always drains into a single component
  if stack.len() != 1 {
    return Err(TreeError::UnreducedStack { len: stack.len() });
  }
  process_stack(CLOSE_ALL, &mut stack, &mut components, &mut owners, map);

  let root = components.len() - 1;
  Ok(ComponentTree::from_parts(components, root, owners, map.width(), map.height()))
}
