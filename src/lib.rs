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

#![doc(
  html_logo_url = "https://raw.githubusercontent.com/smups/rustronomy/main/logos/Rustronomy_ferris.png?raw=true"
)]
//! Rustronomy-mser is a pure-rust implementation of Maximally Stable Extremal
//! Region (MSER) detection (see Matas et al., 2002[^1]), a blob detector that
//! finds the connected dark regions of a grey-scale image that keep (almost)
//! the same shape over a wide range of thresholds.
//!
//! # Features
//! Detection runs in two stages, both provided by this crate:
//! 1. A *component tree* is built over the sublevel sets of the image. Two
//! interchangeable builders are included: a sort-and-merge *global immersion*
//! builder and a flooding builder that runs in linear time (see Nistér &
//! Stewénius, 2008[^2]).
//! 2. The tree is scored for stability and the maximally stable components
//! are harvested as regions, each with a fitted equal-second-moment ellipse.
//!
//! In addition, `rustronomy-mser` provides extra functionality which can be
//! accessed via cargo feature gates. A list of all additional features [can be
//! found below](#cargo-feature-gates).
//!
//! # Quickstart
//! To use the latest release of Rustronomy-mser in a cargo project, add the
//! rustronomy-mser crate as a dependency to your `Cargo.toml` file:
//! ```toml
//! [dependencies]
//! rustronomy-mser = "0.1.0"
//! ```
//! To use Rustronomy-mser in a Jupyter notebook, execute a cell containing the
//! following code:
//! ```text
//! :dep rustronomy-mser = {version = "0.1"}
//! ```
//! If you want to use the latest (unstable) development version of
//! rustronomy-mser, you can do so by using the `git` field (which fetches the
//! latest version from the repo) rather than the `version` field (which
//! downloads the latest released version from crates.io).
//! ```text
//! {git = "https://github.com/smups/rustronomy-mser"}
//! ```
//!
//! ## Short example: detecting regions in a random field
//! `rustronomy-mser` uses the commonly used "builder pattern" to configure the
//! detector before running it. To configure a detector, create an instance of
//! the `DetectorBuilder` struct. Once you are done specifying options for the
//! builder struct using its associated functions, call the `build()` function
//! to generate a (`Sync`&`Send`) detector object, which you can now run on as
//! many images as you like.
//!
//! In this example, we detect regions in a uniform random field. The random
//! field can be generated with the `ndarray_rand` crate. To configure a new
//! detector, one can use the `DetectorBuilder` struct which is included in the
//! `rustronomy_mser` prelude.
//! ```rust
//! use rustronomy_mser::prelude::*;
//! use ndarray as nd;
//! use ndarray_rand::{rand_distr::Uniform, RandomExt};
//!
//! //Create a random uniform image
//! let img = nd::Array2::<u8>::random((64, 64), Uniform::new(0, 255));
//! //Set-up the MSER detector
//! let detector = DetectorBuilder::new_linear_time().set_delta(5).build().unwrap();
//! //Run the detection
//! let detection = detector.detect(img.view()).unwrap();
//! println!("found {} regions in {:.2}ms", detection.len(), detection.elapsed_time_ms());
//! ```
//! [^1]: J. Matas, O. Chum, M. Urban and T. Pajdla. **Robust wide-baseline
//! stereo from maximally stable extremal regions.** *In Proceedings of the
//! British Machine Vision Conference*, 2002.
//!
//! [^2]: D. Nistér and H. Stewénius. **Linear time maximally stable extremal
//! regions.** *In Proceedings of the European Conference on Computer Vision*,
//! 2008.
//!
//! # Cargo feature gates
//! *By default, all features behind cargo feature gates are **disabled***
//! - `jemalloc`: this feature enables the [jemalloc allocator](https://jemalloc.net).
//! From the jemalloc website: *"jemalloc is a general purpose `malloc`(3)
//! implementation that emphasizes fragmentation avoidance and scalable concurrency
//! support."*. Jemalloc is enabled though usage of the `jemalloc` crate, which
//! increases compile times considerably. However, enabling this feature can also
//! greatly improve run-time performance, especially on machines with more (>6 or so)
//! cores. To compile `rustronomy-mser` with the `jemalloc` feature, jemalloc
//! must be installed on the host system.
//! - `plots`: with this feature enabled, `rustronomy-mser` can render grey
//! slices, component label maps and fitted region ellipses to png files.
//! Plotting support adds the `plotters` crate as a dependency, which increases
//! compile times and requires the installation of some packages on linux
//! systems, [see the `plotters` documentation for details](https://docs.rs/plotters/).
//! - `progress`: this feature enables progress bars for the tree builders.
//! Enabling this feature adds the `indicatif` crate as a dependency,
//! which should not considerably slow down compile times.
//! - `debug`: this feature enables debug and performance monitoring output. This
//! can negatively impact performance. Enabling this feature does not add additional
//! dependencies.
//!
//! ## `plots` feature gate
//! Enabling the `plots` feature gate adds the `plotting` module to the crate.
//! It contains free functions: `plot_slice` renders an 8-bit image 1:1 into a
//! png file, `plot_labels` does the same for the component label maps produced
//! by `ComponentTree::label_map` and `ComponentTree::level_slice` (using a
//! procedural colour per label), and `plot_ellipses` draws the fitted region
//! ellipses of a finished detection on top of the input image.
//!
//! The generated plots are png files with no text. Each pixel in the generated
//! images corresponds 1:1 to a pixel in the input array.

//Unconditional imports
use ndarray as nd;
use num_traits::{Num, ToPrimitive};
use rayon::prelude::*;

//Set Jemalloc as the global allocator for this crate
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

//Progress bar (conditional)
#[cfg(feature = "progress")]
use indicatif;

pub mod components;

pub use components::{Component, ComponentTree, Method, Pixel, PixelMap, TreeError};

//Grey levels that non-finite samples are clamped to by the pre-processor.
//MSER looks for dark structure, so unmeasured pixels drown in the background.
const BRIGHT_CLIP: u8 = u8::MAX;
const DARK_CLIP: u8 = u8::MIN;

//Utility prelude for batch import
pub mod prelude {
  pub use crate::{
    Component, ComponentTree, DetectorBuilder, Ellipse, Method, MserData, MserDetection,
    MserDetector, MserError, MserParameters, MserRegion, MserUtils, Pixel, PixelMap, TreeError,
  };
  #[cfg(feature = "plots")]
  pub mod plots {
    pub use crate::plotting::{grey_scale, label_colour, plot_ellipses, plot_labels, plot_slice};
  }
}

////////////////////////////////////////////////////////////////////////////////
//                              HELPER FUNCTIONS                              //
////////////////////////////////////////////////////////////////////////////////

#[cfg(feature = "progress")]
pub(crate) fn set_up_bar(label: &str, len: u64) -> indicatif::ProgressBar {
  let template = format!("{{spinner}}[{{elapsed}}/{{duration}}] {label} {{pos}}/{{len}}{{bar:60}}");
  let style = indicatif::ProgressStyle::with_template(&template);
  let bar = indicatif::ProgressBar::new(len);
  bar.set_style(style.unwrap());
  return bar;
}

////////////////////////////////////////////////////////////////////////////////
//                          OPTIONAL MODULES & TYPES                          //
////////////////////////////////////////////////////////////////////////////////

#[cfg(feature = "debug")]
mod performance_monitoring {
  //! This module contains performance monitoring structs that are used when
  //! the "debug" feature is enabled.

  #[derive(Debug, Default)]
  pub struct PerfReport {
    pub tree_ms: f64,
    pub validate_ms: f64,
    pub variation_ms: f64,
    pub stability_ms: f64,
    pub statistics_ms: f64,
    pub harvest_ms: f64,
    pub components: usize,
    pub regions: usize,
  }

  impl std::fmt::Display for PerfReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      writeln!(f, ">{:-^60}<", "[MSER detector performance report]")?;
      writeln!(f, "  component tree construction: {:.3}ms", self.tree_ms)?;
      writeln!(f, "  tree validation: {:.3}ms", self.validate_ms)?;
      writeln!(f, "  variation scores: {:.3}ms", self.variation_ms)?;
      writeln!(f, "  stability marking: {:.3}ms", self.stability_ms)?;
      writeln!(f, "  pixel statistics: {:.3}ms", self.statistics_ms)?;
      writeln!(f, "  region harvest: {:.3}ms", self.harvest_ms)?;
      writeln!(f, "  components: {}, accepted regions: {}", self.components, self.regions)?;
      write!(f, ">{:-^60}<", "[end of report]")
    }
  }
}

#[cfg(feature = "plots")]
/// This module contains all the code required to generate images from grey
/// slices, component label maps and finished detections, including the
/// included colour maps.
pub mod plotting {
  use ndarray as nd;
  use num_traits::ToPrimitive;
  use plotters::prelude::*;
  use std::{error::Error, path::Path};

  use crate::MserDetection;

  //Colour for masked-out px (the usize::MAX marker of level slices)
  const MASK_COL: RGBColor = BLACK;
  //Colour for region outlines
  const OUTLINE_COL: RGBColor = RGBColor(255, 64, 64);

  pub fn plot_slice<'a, T>(
    slice: nd::ArrayView2<'a, T>,
    file_name: &Path,
    color_map: fn(count: T, min: T, max: T) -> Result<RGBColor, Box<dyn Error>>,
  ) -> Result<(), Box<dyn Error>>
  where
    T: Default + std::fmt::Display + std::cmp::PartialOrd + ToPrimitive + Copy,
  {
    //Get min and max vals of slice
    let min = slice.iter().fold(T::default(), |f: T, x: &T| if *x < f { *x } else { f });
    let max = slice.iter().fold(T::default(), |f: T, x: &T| if *x > f { *x } else { f });

    //Get the size of the slice
    let x_size = slice.shape()[1] as u32;
    let y_size = slice.shape()[0] as u32;

    //Make new fig
    let root = BitMapBackend::new(file_name, (x_size, y_size)).into_drawing_area();
    root.fill(&WHITE)?;

    //make empty drawing area in fig
    let mut chart = ChartBuilder::on(&root).build_cartesian_2d(0..x_size, 0..y_size)?;
    chart.configure_mesh().disable_mesh().disable_axes().draw()?;
    let plotting_area = chart.plotting_area();

    //fill pixels
    for ((y, x), px) in slice.indexed_iter() {
      plotting_area.draw_pixel((x as u32, y as u32), &color_map(*px, min, max)?)?
    }

    //save file
    root.present()?;

    #[cfg(feature = "debug")]
    println!("slice saved as png: {file_name:?}; max:{max:2}, min:{min:2}");
    Ok(())
  }

  /// Renders a label map (as produced by `ComponentTree::label_map` or
  /// `ComponentTree::level_slice`) into a png file, one colour per label.
  pub fn plot_labels(labels: nd::ArrayView2<usize>, file_name: &Path) -> Result<(), Box<dyn Error>> {
    plot_slice(labels, file_name, label_colour)
  }

  /// Draws the fitted ellipses of all detected regions on top of the input
  /// image.
  pub fn plot_ellipses(
    img: nd::ArrayView2<u8>,
    detection: &MserDetection,
    file_name: &Path,
  ) -> Result<(), Box<dyn Error>> {
    let x_size = img.shape()[1] as u32;
    let y_size = img.shape()[0] as u32;

    let root = BitMapBackend::new(file_name, (x_size, y_size)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root).build_cartesian_2d(0..x_size, 0..y_size)?;
    chart.configure_mesh().disable_mesh().disable_axes().draw()?;
    let plotting_area = chart.plotting_area();

    //fill pixels with the grey base image
    for ((y, x), px) in img.indexed_iter() {
      plotting_area.draw_pixel((x as u32, y as u32), &grey_scale(*px, u8::MIN, u8::MAX)?)?
    }

    //trace each region outline, two steps per degree
    for region in detection.regions() {
      let el = region.ellipse();
      let (sin_t, cos_t) = el.theta.sin_cos();
      for step in 0..720 {
        let phi = step as f64 * std::f64::consts::PI / 360.0;
        let (sin_p, cos_p) = phi.sin_cos();
        let x = el.xc + el.ra * cos_t * cos_p - el.rb * sin_t * sin_p;
        let y = el.yc + el.ra * sin_t * cos_p + el.rb * cos_t * sin_p;
        if x >= 0.0 && y >= 0.0 && (x as u32) < x_size && (y as u32) < y_size {
          plotting_area.draw_pixel((x as u32, y as u32), &OUTLINE_COL)?
        }
      }
    }

    //save file
    root.present()?;

    #[cfg(feature = "debug")]
    println!("detection saved as png: {file_name:?}; {} regions", detection.len());
    Ok(())
  }

  #[inline(always)]
  pub fn grey_scale<T>(count: T, min: T, max: T) -> Result<RGBColor, Box<dyn Error>>
  where
    T: std::fmt::Display + std::cmp::PartialOrd + ToPrimitive,
  {
    let min = min.to_f64().ok_or("could not convert minimum to f64")?;
    let max = max.to_f64().ok_or("could not convert maximum to f64")?;
    let count = count.to_f64().ok_or("could not convert count to f64")?;
    let gray = if max > min { ((count - min) / (max - min) * 255.0) as u8 } else { 0 };
    Ok(RGBColor(gray, gray, gray))
  }

  /// Procedural colour for an integer label. Labels are spread over the hue
  /// circle with golden-angle steps, so neighbouring IDs get very different
  /// colours. The `usize::MAX` marker used by `ComponentTree::level_slice`
  /// maps to the mask colour.
  #[inline(always)]
  pub fn label_colour<T>(label: T, _min: T, _max: T) -> Result<RGBColor, Box<dyn Error>>
  where
    T: std::fmt::Display + std::cmp::PartialOrd + ToPrimitive,
  {
    let label = label.to_usize().ok_or("could not convert label to usize")?;
    if label == usize::MAX {
      return Ok(MASK_COL);
    }
    let hue = (label as f64 * 137.507_764) % 360.0;
    let (h, s, v) = (hue / 60.0, 0.65f64, 0.95f64);
    let c = v * s;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let (r, g, b) = match h as u32 {
      0 => (c, x, 0.0),
      1 => (x, c, 0.0),
      2 => (0.0, c, x),
      3 => (0.0, x, c),
      4 => (x, 0.0, c),
      _ => (c, 0.0, x),
    };
    let m = v - c;
    Ok(RGBColor(((r + m) * 255.0) as u8, ((g + m) * 255.0) as u8, ((b + m) * 255.0) as u8))
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                   ERRORS                                   //
////////////////////////////////////////////////////////////////////////////////

/// Top-level error type of this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MserError {
  /// A detector parameter is outside its legal range.
  #[error("invalid parameter `{param}`: {reason}")]
  InvalidParameter { param: &'static str, reason: &'static str },
  /// The input image has zero width or height.
  #[error("cannot build a component tree over an empty image")]
  EmptyImage,
  /// The component tree failed its structural integrity check.
  #[error("component tree integrity check failed: {0}")]
  InvalidTree(#[from] TreeError),
}

////////////////////////////////////////////////////////////////////////////////
//                           DETECTOR CONFIGURATION                           //
////////////////////////////////////////////////////////////////////////////////

/// All knobs of the MSER detector in one flat record. The `Default` impl
/// gives the reference parametrisation; fields are validated as a whole by
/// [`DetectorBuilder::build`] or [`MserParameters::validate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MserParameters {
  /// Component tree construction algorithm.
  pub method: Method,
  /// Number of grey levels a component is compared over when its size
  /// variation is scored.
  pub delta: u8,
  /// Absolute floor on the pixel count of a region.
  pub min_abs_component_area: usize,
  /// Floor on the region size as a fraction of the image size.
  pub min_rel_comp_size: f64,
  /// Ceiling on the region size as a fraction of the image size.
  pub max_rel_comp_size: f64,
  /// Maximum size variation for a region to count as stable enough.
  pub max_size_variation: f64,
  /// Minimum relative size difference to the closest accepted ancestor;
  /// suppresses nested near-duplicates.
  pub min_diversity: f64,
  /// Reject regions whose fitted ellipse is larger than the absolute size
  /// ceiling.
  pub constrain_ellipse_size: bool,
  /// Minimum ratio of region size to ellipse area.
  pub min_compactness: f64,
  /// Run the full structural integrity check on the freshly built tree and
  /// fail hard if it does not pass.
  pub validate_component_tree: bool,
}

impl Default for MserParameters {
  fn default() -> Self {
    MserParameters {
      method: Method::LinearTime,
      delta: 5,
      min_abs_component_area: 3,
      min_rel_comp_size: 0.0001,
      max_rel_comp_size: 0.25,
      max_size_variation: 0.25,
      min_diversity: 0.50,
      constrain_ellipse_size: true,
      min_compactness: 0.2,
      validate_component_tree: false,
    }
  }
}

impl MserParameters {
  /// Checks every field against its legal range.
  pub fn validate(&self) -> Result<(), MserError> {
    fn bad(param: &'static str, reason: &'static str) -> Result<(), MserError> {
      Err(MserError::InvalidParameter { param, reason })
    }
    if self.delta < 1 {
      return bad("delta", "must be at least 1");
    }
    if self.min_abs_component_area < 1 {
      return bad("min_abs_component_area", "must be at least 1");
    }
    if !(0.0..=1.0).contains(&self.min_rel_comp_size) {
      return bad("min_rel_comp_size", "must lie in [0, 1]");
    }
    if !(0.0..=1.0).contains(&self.max_rel_comp_size) {
      return bad("max_rel_comp_size", "must lie in [0, 1]");
    }
    if self.min_rel_comp_size > self.max_rel_comp_size {
      return bad("min_rel_comp_size", "must not exceed max_rel_comp_size");
    }
    if !(self.max_size_variation > 0.0) {
      return bad("max_size_variation", "must be positive");
    }
    if !(0.0..=1.0).contains(&self.min_diversity) {
      return bad("min_diversity", "must lie in [0, 1]");
    }
    if !(0.0..=1.0).contains(&self.min_compactness) {
      return bad("min_compactness", "must lie in [0, 1]");
    }
    Ok(())
  }
}

/// Builder used to configure a [`MserDetector`].
#[derive(Debug, Clone)]
pub struct DetectorBuilder {
  params: MserParameters,
}

impl DetectorBuilder {
  /// New builder for a detector using the linear-time flooding tree builder.
  pub fn new_linear_time() -> Self {
    DetectorBuilder {
      params: MserParameters { method: Method::LinearTime, ..MserParameters::default() },
    }
  }

  /// New builder for a detector using the global immersion tree builder.
  pub fn new_global_immersion() -> Self {
    DetectorBuilder {
      params: MserParameters { method: Method::GlobalImmersion, ..MserParameters::default() },
    }
  }

  /// New builder starting from an existing parameter record.
  pub fn from_parameters(params: MserParameters) -> Self {
    DetectorBuilder { params }
  }

  pub fn set_delta(mut self, delta: u8) -> Self {
    self.params.delta = delta;
    self
  }

  pub fn set_min_abs_component_area(mut self, area: usize) -> Self {
    self.params.min_abs_component_area = area;
    self
  }

  pub fn set_min_rel_comp_size(mut self, size: f64) -> Self {
    self.params.min_rel_comp_size = size;
    self
  }

  pub fn set_max_rel_comp_size(mut self, size: f64) -> Self {
    self.params.max_rel_comp_size = size;
    self
  }

  pub fn set_max_size_variation(mut self, variation: f64) -> Self {
    self.params.max_size_variation = variation;
    self
  }

  pub fn set_min_diversity(mut self, diversity: f64) -> Self {
    self.params.min_diversity = diversity;
    self
  }

  pub fn set_constrain_ellipse_size(mut self, constrain: bool) -> Self {
    self.params.constrain_ellipse_size = constrain;
    self
  }

  pub fn set_min_compactness(mut self, compactness: f64) -> Self {
    self.params.min_compactness = compactness;
    self
  }

  pub fn set_validate_component_tree(mut self, validate: bool) -> Self {
    self.params.validate_component_tree = validate;
    self
  }

  /// Validates the configured parameters and produces the detector.
  pub fn build(self) -> Result<MserDetector, MserError> {
    self.params.validate()?;
    Ok(MserDetector { params: self.params })
  }
}

////////////////////////////////////////////////////////////////////////////////
//                              MOMENTS & ELLIPSE                             //
////////////////////////////////////////////////////////////////////////////////

/// Equal-second-moment ellipse of a pixel set: centre, semi-major and
/// semi-minor radii and the orientation of the major axis (radians, measured
/// from the x-axis).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipse {
  pub xc: f64,
  pub yc: f64,
  pub ra: f64,
  pub rb: f64,
  pub theta: f64,
}

impl Ellipse {
  pub fn area(&self) -> f64 {
    self.ra * self.rb * std::f64::consts::PI
  }
}

/// Closed-form eigensystem of the 2x2 matrix [[a, b], [c, d]]. Eigenvalues
/// come out in decreasing order; eigenvectors are not normalised. Only valid
/// for matrices with real eigenvalues (symmetric ones always qualify).
fn eigen_2x2(a: f64, b: f64, c: f64, d: f64) -> ([f64; 2], [[f64; 2]; 2]) {
  let r = (a + d) / 2.0;
  let s = (a - d) / 2.0;
  let t = (s * s + b * c).sqrt();
  let eigenvalues = [r + t, r - t];
  let eigenvectors = if a - d > 0.0 {
    [[s + t, c], [b, -(s + t)]]
  } else if a - d < 0.0 {
    [[b, -s + t], [s - t, c]]
  } else {
    let (b_abs, c_abs) = (b.abs(), c.abs());
    let bc_root = (b * c).sqrt();
    if b_abs < c_abs {
      [[bc_root, c], [-bc_root, c]]
    } else if b_abs > c_abs {
      [[b, bc_root], [b, -bc_root]]
    } else if c_abs > 0.0 {
      [[c, c], [-c, c]]
    } else {
      //all elements equal: any vector is an eigenvector, pick the axes
      [[0.0, 1.0], [1.0, 0.0]]
    }
  };
  (eigenvalues, eigenvectors)
}

/// Fits the equal-second-moment ellipse to a pixel set described by its
/// accumulated coordinate sums (Σx, Σy, Σx², Σy², Σxy) and pixel count.
fn fit_ellipse(stats: &[i64; 5], n: usize) -> Ellipse {
  let nf = n as f64;
  let (sx, sy) = (stats[0] as f64, stats[1] as f64);
  let (sxx, syy, sxy) = (stats[2] as f64, stats[3] as f64, stats[4] as f64);
  //central moments (n times the covariance)
  let mu20 = sxx - sx * sx / nf;
  let mu02 = syy - sy * sy / nf;
  let mu11 = sxy - sx * sy / nf;
  let (eigenvalues, eigenvectors) = eigen_2x2(mu20, mu11, mu11, mu02);
  //radii of a uniform ellipse with the same second moments; a marginally
  //negative small eigenvalue (collinear pixel sets) turns into a NaN radius,
  //which downstream comparisons treat as "no usable ellipse"
  let ra = 2.0 * (eigenvalues[0] / nf).sqrt();
  let rb = 2.0 * (eigenvalues[1] / nf).sqrt();
  let theta = eigenvectors[0][1].atan2(eigenvectors[0][0]);
  Ellipse { xc: sx / nf, yc: sy / nf, ra, rb, theta }
}

/// Per-component annotations produced by the detector: stability scores,
/// coordinate statistics and (for accepted regions) the fitted ellipse. The
/// component tree itself is never modified.
#[derive(Debug, Clone)]
pub struct MserData {
  pub(crate) variation: f32,
  pub(crate) stable: bool,
  pub(crate) mser: bool,
  pub(crate) stats: [i64; 5],
  pub(crate) size: usize,
  pub(crate) ellipse: Option<Ellipse>,
}

impl MserData {
  fn new() -> Self {
    MserData {
      variation: f32::INFINITY,
      stable: true,
      mser: false,
      stats: [0; 5],
      size: 0,
      ellipse: None,
    }
  }

  /// Relative size growth over `delta` grey levels (+∞ when the tree above
  /// this component is shallower than `delta`).
  pub fn variation(&self) -> f32 {
    self.variation
  }

  /// Whether this component survived the local stability competition.
  pub fn is_stable(&self) -> bool {
    self.stable
  }

  /// Whether this component was accepted as a region.
  pub fn is_mser(&self) -> bool {
    self.mser
  }

  /// Accumulated coordinate sums (Σx, Σy, Σx², Σy², Σxy) over the component.
  pub fn stats(&self) -> &[i64; 5] {
    &self.stats
  }

  /// Central moments (mu10, mu01, mu20, mu02, mu11) of the pixel coordinates.
  pub fn central_moments(&self) -> [f64; 5] {
    let nf = self.size as f64;
    let (sx, sy) = (self.stats[0] as f64, self.stats[1] as f64);
    [
      sx / nf,
      sy / nf,
      self.stats[2] as f64 - sx * sx / nf,
      self.stats[3] as f64 - sy * sy / nf,
      self.stats[4] as f64 - sx * sy / nf,
    ]
  }

  /// Covariance matrix of the pixel coordinates.
  pub fn covariance_matrix(&self) -> [[f64; 2]; 2] {
    let mu = self.central_moments();
    let nf = self.size as f64;
    [[mu[2] / nf, mu[4] / nf], [mu[4] / nf, mu[3] / nf]]
  }

  /// Centroid of the pixel coordinates.
  pub fn center(&self) -> (f64, f64) {
    let mu = self.central_moments();
    (mu[0], mu[1])
  }

  /// Fitted ellipse; only present on accepted regions.
  pub fn ellipse(&self) -> Option<Ellipse> {
    self.ellipse
  }
}

////////////////////////////////////////////////////////////////////////////////
//                                MSER DETECTOR                               //
////////////////////////////////////////////////////////////////////////////////

/// A configured MSER detector. Build one with [`DetectorBuilder`], then run
/// [`MserDetector::detect`] on any number of images; the detector itself is
/// immutable, so it can be shared freely between threads.
#[derive(Debug, Clone)]
pub struct MserDetector {
  params: MserParameters,
}

impl MserDetector {
  pub fn parameters(&self) -> &MserParameters {
    &self.params
  }

  /// Runs the full detection pipeline on an 8-bit image: component tree
  /// construction, stability scoring and region harvest.
  pub fn detect(&self, img: nd::ArrayView2<u8>) -> Result<MserDetection, MserError> {
    let start = std::time::Instant::now();
    #[cfg(feature = "debug")]
    let mut perf = performance_monitoring::PerfReport::default();
    #[cfg(feature = "debug")]
    let mut stage = std::time::Instant::now();

    //(1) build the component tree of the sublevel sets
    let tree = ComponentTree::from_image(img, self.params.method)?;
    #[cfg(feature = "debug")]
    {
      perf.tree_ms = stage.elapsed().as_secs_f64() * 1e3;
      stage = std::time::Instant::now();
    }

    //(2) optionally prove the tree structurally sound before using it
    if self.params.validate_component_tree {
      tree.validate()?;
    }
    #[cfg(feature = "debug")]
    {
      perf.validate_ms = stage.elapsed().as_secs_f64() * 1e3;
      stage = std::time::Instant::now();
    }

    //(3) score the size variation of every component over delta grey levels
    let mut data = variation_scores(&tree, self.params.delta);
    #[cfg(feature = "debug")]
    {
      perf.variation_ms = stage.elapsed().as_secs_f64() * 1e3;
      stage = std::time::Instant::now();
    }

    //(4) stability competition between components on consecutive levels
    mark_stability(&tree, &mut data);
    #[cfg(feature = "debug")]
    {
      perf.stability_ms = stage.elapsed().as_secs_f64() * 1e3;
      stage = std::time::Instant::now();
    }

    //(5) accumulate the coordinate statistics bottom-up
    accumulate_statistics(&tree, &mut data);
    #[cfg(feature = "debug")]
    {
      perf.statistics_ms = stage.elapsed().as_secs_f64() * 1e3;
      stage = std::time::Instant::now();
    }

    //(6) harvest the maximally stable regions
    let msers = harvest(&tree, &mut data, &self.params);
    #[cfg(feature = "debug")]
    {
      perf.harvest_ms = stage.elapsed().as_secs_f64() * 1e3;
      perf.components = tree.len();
      perf.regions = msers.len();
      println!("{perf}");
    }

    let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;
    Ok(MserDetection { tree, data, msers, elapsed_ms })
  }
}

/// Variation of every component: relative size difference to the last
/// ancestor still within `delta` grey levels. Read-only over the tree, so
/// all components are scored in parallel.
fn variation_scores(tree: &ComponentTree, delta: u8) -> Vec<MserData> {
  let comps = tree.components();
  (0..comps.len())
    .into_par_iter()
    .map(|i| {
      let mut data = MserData::new();
      let target = comps[i].level() as i32 + delta as i32;
      //climb to the last ancestor below the target level
      let mut cc = i;
      let mut parent = comps[i].parent();
      while let Some(p) = parent {
        if comps[p].level() as i32 >= target {
          break;
        }
        cc = p;
        parent = comps[p].parent();
      }
      if parent.is_some() {
        data.variation =
          (comps[cc].size() - comps[i].size()) as f32 / comps[i].size() as f32;
      }
      data
    })
    .collect()
}

/// A component is maximally stable when its variation is a local minimum
/// along its ancestor line. Only components one grey level apart compete;
/// equal variation leaves both stable. The root never qualifies.
fn mark_stability(tree: &ComponentTree, data: &mut [MserData]) {
  data[tree.root_index()].stable = false;
  for i in 0..tree.len() {
    if let Some(p) = tree[i].parent() {
      if tree[i].level() + 1 == tree[p].level() {
        let (vc, vp) = (data[i].variation, data[p].variation);
        if vc < vp {
          data[p].stable = false;
        } else if vc > vp {
          data[i].stable = false;
        }
      }
    }
  }
}

/// Sums pixel coordinates (Σx, Σy, Σx², Σy², Σxy) over every component,
/// children first. Walking the arena in level order guarantees that all
/// children are finished before their parent comes up.
fn accumulate_statistics(tree: &ComponentTree, data: &mut [MserData]) {
  for i in tree.sorted_by_level() {
    let c = &tree[i];
    let mut stats = [0i64; 5];
    for px in c.local_pixels() {
      let (x, y) = (px.x as i64, px.y as i64);
      stats[0] += x;
      stats[1] += y;
      stats[2] += x * x;
      stats[3] += y * y;
      stats[4] += x * y;
    }
    for &ch in c.children() {
      for k in 0..5 {
        stats[k] += data[ch].stats[k];
      }
    }
    data[i].stats = stats;
    data[i].size = c.size();
  }
}

/// Walks the tree from the root and collects all components that pass the
/// stability, size, diversity and shape tests. `ancestor` tracks the size of
/// the closest accepted ancestor, which drives the diversity test.
fn harvest(tree: &ComponentTree, data: &mut [MserData], params: &MserParameters) -> Vec<usize> {
  let img_size = tree.width() * tree.height();
  let min_size_abs =
    ((img_size as f64 * params.min_rel_comp_size) as usize).max(params.min_abs_component_area);
  let max_size_abs = (img_size as f64 * params.max_rel_comp_size) as usize;

  let mut msers = Vec::new();
  let mut stack: Vec<(usize, usize)> = vec![(tree.root_index(), usize::MAX)];
  while let Some((i, ancestor)) = stack.pop() {
    let ac = tree[i].size();
    let mut pass_down = ancestor;
    if data[i].stable
      && min_size_abs <= ac
      && ac <= max_size_abs
      && (data[i].variation as f64) <= params.max_size_variation
      && (ancestor - ac) as f64 / ancestor as f64 >= params.min_diversity
    {
      let ellipse = fit_ellipse(&data[i].stats, ac);
      let ellipse_area = ellipse.area();
      let compactness = ac as f64 / ellipse_area;
      //ignore regions whose ellipse outgrew the size ceiling (if turned on)
      //and regions much smaller than their ellipse (not compact at all)
      if (!params.constrain_ellipse_size || ellipse_area <= max_size_abs as f64)
        && compactness > params.min_compactness
      {
        data[i].ellipse = Some(ellipse);
        data[i].mser = true;
        msers.push(i);
        pass_down = ac;
      }
    }
    //no component below the size floor can produce an acceptable descendant
    if ac > min_size_abs {
      for &ch in tree[i].children().iter().rev() {
        stack.push((ch, pass_down));
      }
    }
  }
  msers
}

////////////////////////////////////////////////////////////////////////////////
//                              DETECTION RESULT                              //
////////////////////////////////////////////////////////////////////////////////

/// Result of one detector run: the component tree, the per-component
/// annotations and the accepted regions (in harvest order, largest first
/// along every root-to-leaf path).
#[derive(Debug, Clone)]
pub struct MserDetection {
  tree: ComponentTree,
  data: Vec<MserData>,
  msers: Vec<usize>,
  elapsed_ms: f64,
}

impl MserDetection {
  /// Number of accepted regions.
  pub fn len(&self) -> usize {
    self.msers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.msers.is_empty()
  }

  /// Iterates over the accepted regions in harvest order.
  pub fn regions(&self) -> impl Iterator<Item = MserRegion<'_>> + '_ {
    self.msers.iter().map(move |&idx| MserRegion { detection: self, idx })
  }

  /// The n-th accepted region.
  pub fn get(&self, n: usize) -> Option<MserRegion<'_>> {
    self.msers.get(n).map(move |&idx| MserRegion { detection: self, idx })
  }

  /// The component tree the regions were harvested from.
  pub fn component_tree(&self) -> &ComponentTree {
    &self.tree
  }

  /// Per-component annotations, indexed like the component arena.
  pub fn mser_data(&self) -> &[MserData] {
    &self.data
  }

  /// Arena indices of the accepted regions.
  pub fn mser_indices(&self) -> &[usize] {
    &self.msers
  }

  /// Wall time of the full detector run.
  pub fn elapsed_time_ms(&self) -> f64 {
    self.elapsed_ms
  }
}

/// Lightweight view of one accepted region. Borrows from the detection it
/// came from; materialising the pixel set is the only allocating accessor.
#[derive(Debug, Clone, Copy)]
pub struct MserRegion<'a> {
  detection: &'a MserDetection,
  idx: usize,
}

impl MserRegion<'_> {
  /// Component ID (arena index) of this region.
  pub fn id(&self) -> usize {
    self.idx
  }

  /// Grey level at which the region was extracted.
  pub fn level(&self) -> u8 {
    self.detection.tree[self.idx].level()
  }

  /// Pixel count of the region.
  pub fn size(&self) -> usize {
    self.detection.tree[self.idx].size()
  }

  /// Stability score of the region (lower is more stable).
  pub fn variation(&self) -> f32 {
    self.detection.data[self.idx].variation
  }

  /// The fitted equal-second-moment ellipse.
  pub fn ellipse(&self) -> Ellipse {
    self.detection.data[self.idx].ellipse.expect("accepted regions always carry an ellipse")
  }

  /// Centroid of the region.
  pub fn center(&self) -> (f64, f64) {
    let el = self.ellipse();
    (el.xc, el.yc)
  }

  /// Materialises all pixels of the region, descendants included.
  pub fn pixels(&self) -> Vec<Pixel> {
    self.detection.tree.all_pixels(self.idx)
  }
}

////////////////////////////////////////////////////////////////////////////////
//                               UTILITY TRAIT                                //
////////////////////////////////////////////////////////////////////////////////

/// Utility functions for preparing images for MSER detection.
pub trait MserUtils {
  /// Maps an array of any numeric type to the 8-bit grey domain. Finite
  /// values are rescaled to span the full grey range; NaN's and +∞ end up at
  /// the bright clipping value (invisible to the detector), -∞ at the dark
  /// one. Constant input maps to an all-dark image.
  fn pre_processor<T, D>(&self, input: nd::ArrayView<T, D>) -> nd::Array<u8, D>
  where
    T: Num + Copy + ToPrimitive + PartialOrd,
    D: nd::Dimension,
  {
    //(1) find the finite dynamic range of the input
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for x in input.iter() {
      if let Some(v) = x.to_f64() {
        if v.is_finite() {
          if v < min {
            min = v;
          }
          if v > max {
            max = v;
          }
        }
      }
    }
    let range = max - min;
    //(2) clamp the specials and rescale everything else
    input.mapv(|x| match x.to_f64() {
      None => BRIGHT_CLIP,
      Some(v) if v.is_nan() || v == f64::INFINITY => BRIGHT_CLIP,
      Some(v) if v == f64::NEG_INFINITY => DARK_CLIP,
      Some(v) => {
        if range > 0.0 {
          (((v - min) / range) * u8::MAX as f64).round() as u8
        } else {
          DARK_CLIP
        }
      }
    })
  }

  /// Flips the grey scale. MSER detection looks for dark structure; running
  /// the detector on the inverted image finds the bright structure instead.
  fn invert(&self, img: nd::ArrayView2<u8>) -> nd::Array2<u8> {
    img.mapv(|v| u8::MAX - v)
  }
}

impl MserUtils for MserDetector {}
