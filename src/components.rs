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

//! Component trees of sublevel sets ("max-trees"). A component tree holds one
//! node per extremal region of the input image; nodes live in a flat arena and
//! refer to each other through arena indices.

use ndarray as nd;

mod flooding;
mod immersion;

//Neighbour look-up tables (4-connectivity): right, up, left, down
pub(crate) const DX: [isize; 4] = [1, 0, -1, 0];
pub(crate) const DY: [isize; 4] = [0, -1, 0, 1];

////////////////////////////////////////////////////////////////////////////////
//                                 PIXEL MAP                                  //
////////////////////////////////////////////////////////////////////////////////

/// A single image sample: integer coordinates plus the 8-bit grey value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pixel {
  pub x: u32,
  pub y: u32,
  pub val: u8,
}

/// Row-major copy of an 8-bit image, immutable once constructed. Both tree
/// builders consume a `PixelMap` rather than the raw array so that raster
/// indexing and the 4-connectivity neighbour table live in one place.
#[derive(Debug, Clone)]
pub struct PixelMap {
  width: usize,
  height: usize,
  pixels: Vec<Pixel>,
}

impl PixelMap {
  /// Copies a 2-dimensional array view into a pixel map. The view is walked
  /// in logical row-major order, so non-standard memory layouts are fine.
  pub fn new(img: nd::ArrayView2<u8>) -> Self {
    let (height, width) = img.dim();
    let mut pixels = Vec::with_capacity(width * height);
    for ((y, x), &val) in img.indexed_iter() {
      pixels.push(Pixel { x: x as u32, y: y as u32, val });
    }
    PixelMap { width, height, pixels }
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  /// Number of pixels in the map.
  pub fn len(&self) -> usize {
    self.pixels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pixels.is_empty()
  }

  #[inline]
  pub fn pixel(&self, idx: u32) -> Pixel {
    self.pixels[idx as usize]
  }

  #[inline]
  pub fn value(&self, idx: u32) -> u8 {
    self.pixels[idx as usize].val
  }

  /// Raster index of the coordinate `(x, y)`.
  #[inline]
  pub fn index_of(&self, x: u32, y: u32) -> u32 {
    (y as usize * self.width + x as usize) as u32
  }

  /// Raster index of the neighbour of `idx` in direction `dir` (see `DX`/
  /// `DY`), or `None` if that neighbour falls outside the image.
  #[inline]
  pub(crate) fn neighbour(&self, idx: u32, dir: u8) -> Option<u32> {
    let px = self.pixels[idx as usize];
    let nx = px.x as isize + DX[dir as usize];
    let ny = px.y as isize + DY[dir as usize];
    if nx < 0 || ny < 0 || nx >= self.width as isize || ny >= self.height as isize {
      None
    } else {
      Some(self.index_of(nx as u32, ny as u32))
    }
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                 COMPONENTS                                 //
////////////////////////////////////////////////////////////////////////////////

/// The algorithm used to build a [`ComponentTree`]. Both produce the same
/// canonical tree; they differ in asymptotic cost and in the order in which
/// arena slots are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
  /// Sort all pixels, then merge with a union-find structure. O(N log N).
  GlobalImmersion,
  /// Flood from a single source with per-level boundary queues. O(N).
  #[default]
  LinearTime,
}

/// One extremal region: a maximal connected set of pixels with values up to
/// (and including) `level`. The pixels *at* `level` are stored locally; the
/// rest is held by the children.
#[derive(Debug, Clone)]
pub struct Component {
  pub(crate) level: u8,
  pub(crate) local: Vec<Pixel>,
  pub(crate) size: usize,
  pub(crate) parent: Option<usize>,
  pub(crate) children: Vec<usize>,
}

impl Component {
  pub(crate) fn new(level: u8) -> Self {
    Component { level, local: Vec::new(), size: 0, parent: None, children: Vec::new() }
  }

  /// Grey level of this component.
  pub fn level(&self) -> u8 {
    self.level
  }

  /// Total number of pixels in this component, descendants included.
  pub fn size(&self) -> usize {
    self.size
  }

  /// Arena index of the parent component (`None` for the root).
  pub fn parent(&self) -> Option<usize> {
    self.parent
  }

  /// Arena indices of the child components, in attachment order.
  pub fn children(&self) -> &[usize] {
    &self.children
  }

  /// The pixels whose grey value equals this component's level.
  pub fn local_pixels(&self) -> &[Pixel] {
    &self.local
  }

  pub fn is_root(&self) -> bool {
    self.parent.is_none()
  }

  pub fn is_leaf(&self) -> bool {
    self.children.is_empty()
  }
}

////////////////////////////////////////////////////////////////////////////////
//                               COMPONENT TREE                               //
////////////////////////////////////////////////////////////////////////////////

/// Everything that can go wrong inside a component tree. Returned by
/// [`ComponentTree::validate`] and, for the stack variant, raised by the
/// linear-time builder itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
  #[error("component {comp} is reachable through more than one parent")]
  DuplicateNode { comp: usize },
  #[error("{found} of {total} components cannot be reached from the root")]
  UnreachableNodes { found: usize, total: usize },
  #[error("component {child} is missing from the child list of its parent {parent}")]
  MissingChildLink { child: usize, parent: usize },
  #[error("component {child} does not point back at its parent {parent}")]
  MissingParentLink { child: usize, parent: usize },
  #[error("tree has {found} root components, expected exactly 1")]
  RootCount { found: usize },
  #[error("component {child} (level {child_level}) is not strictly below its parent {parent} (level {parent_level})")]
  LevelOrder { child: usize, child_level: u8, parent: usize, parent_level: u8 },
  #[error("component {comp} (level {level}) holds a local pixel with value {value}")]
  LocalPixelLevel { comp: usize, level: u8, value: u8 },
  #[error("component {comp} claims size {stored}, but its pixels sum to {computed}")]
  SizeMismatch { comp: usize, stored: usize, computed: usize },
  #[error("flooding left {len} open components on the stack, expected exactly 1")]
  UnreducedStack { len: usize },
}

/// The full hierarchy of extremal regions of one image. Nodes live in a flat
/// arena (`Vec<Component>`); the arena index doubles as the externally
/// visible component ID and is assigned in construction order, which makes
/// all derived output deterministic.
#[derive(Debug, Clone)]
pub struct ComponentTree {
  components: Vec<Component>,
  root: usize,
  //for every pixel: arena index of the component it is local to
  owners: Vec<u32>,
  width: usize,
  height: usize,
}

impl ComponentTree {
  /// Builds the component tree of `img` with the given method.
  pub fn from_image(img: nd::ArrayView2<u8>, method: Method) -> Result<Self, crate::MserError> {
    Self::from_pixel_map(&PixelMap::new(img), method)
  }

  /// Builds the component tree of an existing pixel map.
  pub fn from_pixel_map(map: &PixelMap, method: Method) -> Result<Self, crate::MserError> {
    if map.is_empty() {
      return Err(crate::MserError::EmptyImage);
    }
    match method {
      Method::GlobalImmersion => Ok(immersion::build(map)),
      Method::LinearTime => Ok(flooding::build(map)?),
    }
  }

  pub(crate) fn from_parts(
    components: Vec<Component>,
    root: usize,
    owners: Vec<u32>,
    width: usize,
    height: usize,
  ) -> Self {
    ComponentTree { components, root, owners, width, height }
  }

  /// Number of components in the tree.
  pub fn len(&self) -> usize {
    self.components.len()
  }

  /// A component tree always holds at least the root.
  pub fn is_empty(&self) -> bool {
    false
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  /// Arena index of the root component.
  pub fn root_index(&self) -> usize {
    self.root
  }

  pub fn root(&self) -> &Component {
    &self.components[self.root]
  }

  /// All components in arena (ID) order.
  pub fn components(&self) -> &[Component] {
    &self.components
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Component> {
    self.components.iter()
  }

  /// Arena indices of all childless components.
  pub fn leaves(&self) -> Vec<usize> {
    (0..self.components.len()).filter(|&i| self.components[i].is_leaf()).collect()
  }

  /// Arena index of the component that coordinate `(x, y)` is local to, i.e.
  /// the smallest region containing that pixel. `None` outside the image.
  pub fn component_at(&self, x: u32, y: u32) -> Option<usize> {
    if (x as usize) < self.width && (y as usize) < self.height {
      Some(self.owners[y as usize * self.width + x as usize] as usize)
    } else {
      None
    }
  }

  /// All pixels of component `idx`, local pixels of all descendants included.
  /// The result is materialised in depth-first order.
  pub fn all_pixels(&self, idx: usize) -> Vec<Pixel> {
    let mut out = Vec::with_capacity(self.components[idx].size);
    let mut stack = vec![idx];
    while let Some(i) = stack.pop() {
      let c = &self.components[i];
      out.extend_from_slice(&c.local);
      stack.extend(c.children.iter().rev());
    }
    out
  }

  /// Renders the per-pixel component IDs into an array of the original image
  /// shape. Pixels map to the component they are local to.
  pub fn label_map(&self) -> nd::Array2<usize> {
    let width = self.width;
    let mut out = nd::Array2::<usize>::zeros((self.height, self.width));
    nd::Zip::indexed(&mut out).par_for_each(|(y, x), label| {
      *label = self.owners[y * width + x] as usize;
    });
    out
  }

  /// Partition of the sublevel set at `level`: every pixel with a value up to
  /// `level` maps to the ID of the region containing it at that threshold,
  /// all other pixels map to `usize::MAX`. Walks the ancestor chain per
  /// pixel, so this is diagnostic-grade rather than fast.
  pub fn level_slice(&self, level: u8) -> nd::Array2<usize> {
    let width = self.width;
    let mut out = nd::Array2::<usize>::zeros((self.height, self.width));
    nd::Zip::indexed(&mut out).par_for_each(|(y, x), label| {
      let mut c = self.owners[y * width + x] as usize;
      *label = if self.components[c].level > level {
        usize::MAX
      } else {
        while let Some(p) = self.components[c].parent {
          if self.components[p].level > level {
            break;
          }
          c = p;
        }
        c
      };
    });
    out
  }

  /// Arena indices sorted by decreasing component size (ties by ID).
  pub fn sorted_by_size(&self) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..self.components.len()).collect();
    idx.sort_by(|&a, &b| {
      self.components[b].size.cmp(&self.components[a].size).then(a.cmp(&b))
    });
    idx
  }

  /// Arena indices sorted by increasing grey level (ties by ID).
  pub fn sorted_by_level(&self) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..self.components.len()).collect();
    idx.sort_by(|&a, &b| {
      self.components[a].level.cmp(&self.components[b].level).then(a.cmp(&b))
    });
    idx
  }

  /// Full structural integrity check: link symmetry, reachability, unique
  /// root, strict level ordering, local pixel levels and size bookkeeping.
  /// Construction is expected to always produce a valid tree; this is meant
  /// for tests and for callers that cannot afford silent corruption.
  pub fn validate(&self) -> Result<(), TreeError> {
    let total = self.components.len();

    //(1) every component must be reachable from the root exactly once
    let mut seen = vec![false; total];
    let mut stack = vec![self.root];
    seen[self.root] = true;
    let mut reached = 1usize;
    while let Some(i) = stack.pop() {
      for &ch in &self.components[i].children {
        if seen[ch] {
          return Err(TreeError::DuplicateNode { comp: ch });
        }
        seen[ch] = true;
        reached += 1;
        stack.push(ch);
      }
    }
    if reached != total {
      return Err(TreeError::UnreachableNodes { found: total - reached, total });
    }

    //(2) parent/child links must be symmetric
    for (i, c) in self.components.iter().enumerate() {
      if let Some(p) = c.parent {
        if !self.components[p].children.contains(&i) {
          return Err(TreeError::MissingChildLink { child: i, parent: p });
        }
      }
      for &ch in &c.children {
        if self.components[ch].parent != Some(i) {
          return Err(TreeError::MissingParentLink { child: ch, parent: i });
        }
      }
    }

    //(3) exactly one root, and it must be the recorded one
    let roots = self.components.iter().filter(|c| c.is_root()).count();
    if roots != 1 || !self.components[self.root].is_root() {
      return Err(TreeError::RootCount { found: roots });
    }

    //(4) levels grow strictly upward and local pixels sit at their level
    for (i, c) in self.components.iter().enumerate() {
      if let Some(p) = c.parent {
        if self.components[p].level <= c.level {
          return Err(TreeError::LevelOrder {
            child: i,
            child_level: c.level,
            parent: p,
            parent_level: self.components[p].level,
          });
        }
      }
      for px in &c.local {
        if px.val != c.level {
          return Err(TreeError::LocalPixelLevel { comp: i, level: c.level, value: px.val });
        }
      }
    }

    //(5) sizes must add up: own local pixels plus all child sizes
    for (i, c) in self.components.iter().enumerate() {
      let computed =
        c.local.len() + c.children.iter().map(|&ch| self.components[ch].size).sum::<usize>();
      if computed != c.size {
        return Err(TreeError::SizeMismatch { comp: i, stored: c.size, computed });
      }
    }

    Ok(())
  }
}

impl std::ops::Index<usize> for ComponentTree {
  type Output = Component;
  fn index(&self, idx: usize) -> &Component {
    &self.components[idx]
  }
}

impl<'a> IntoIterator for &'a ComponentTree {
  type Item = &'a Component;
  type IntoIter = std::slice::Iter<'a, Component>;
  fn into_iter(self) -> Self::IntoIter {
    self.components.iter()
  }
}
