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

use ndarray as nd;
use ndarray_rand::{rand_distr::Uniform, RandomExt};
use rand::{rngs::StdRng, SeedableRng};
use rustronomy_mser::prelude::*;

/// Three nested dark squares on a bright background, all centred on
/// (19.5, 19.5): 18x18 at level 80, 12x12 at level 40 and 8x8 at level 0.
/// Every square keeps its exact shape over many thresholds, so all three are
/// maximally stable by a wide margin.
fn nested_blob() -> nd::Array2<u8> {
  let mut img = nd::Array2::<u8>::from_elem((40, 40), 200);
  img.slice_mut(nd::s![11..29, 11..29]).fill(80);
  img.slice_mut(nd::s![14..26, 14..26]).fill(40);
  img.slice_mut(nd::s![16..24, 16..24]).fill(0);
  img
}

/// Area of the moment ellipse of an axis-aligned a-by-a square.
fn square_ellipse_area(a: f64) -> f64 {
  std::f64::consts::PI * (a * a - 1.0) / 3.0
}

#[test]
fn nested_blob_yields_three_regions() {
  let img = nested_blob();
  let detector = DetectorBuilder::new_linear_time().build().unwrap();
  let detection = detector.detect(img.view()).unwrap();

  //the harvest walks from the root down, so regions come out largest first
  assert_eq!(detection.len(), 3);
  let sizes: Vec<usize> = detection.regions().map(|r| r.size()).collect();
  assert_eq!(sizes, vec![324, 144, 64]);
  let levels: Vec<u8> = detection.regions().map(|r| r.level()).collect();
  assert_eq!(levels, vec![80, 40, 0]);

  for (region, a) in detection.regions().zip([18.0f64, 12.0, 8.0]) {
    //a region that never changes shape has no size variation at all
    assert_eq!(region.variation(), 0.0);

    //the moment ellipse of a square sits at its centre and is round
    let ellipse = region.ellipse();
    assert!((ellipse.xc - 19.5).abs() < 1e-9);
    assert!((ellipse.yc - 19.5).abs() < 1e-9);
    assert!((ellipse.ra - ellipse.rb).abs() < 1e-9);
    assert!((ellipse.area() - square_ellipse_area(a)).abs() < 1e-6);

    //all pixels of the region are at most as bright as its level
    let pixels = region.pixels();
    assert_eq!(pixels.len(), region.size());
    assert!(pixels.iter().all(|px| px.val <= region.level()));
  }
}

#[test]
fn two_blobs_yield_six_regions() {
  //two copies of the nested blob, side by side
  let mut img = nd::Array2::<u8>::from_elem((40, 80), 200);
  for shift in [0usize, 40] {
    img.slice_mut(nd::s![11..29, 11 + shift..29 + shift]).fill(80);
    img.slice_mut(nd::s![14..26, 14 + shift..26 + shift]).fill(40);
    img.slice_mut(nd::s![16..24, 16 + shift..24 + shift]).fill(0);
  }
  let detector = DetectorBuilder::new_linear_time().build().unwrap();
  let detection = detector.detect(img.view()).unwrap();

  assert_eq!(detection.len(), 6);
  let left = detection.regions().filter(|r| r.center().0 < 40.0).count();
  let right = detection.regions().filter(|r| r.center().0 > 40.0).count();
  assert_eq!(left, 3);
  assert_eq!(right, 3);
}

#[test]
fn large_delta_rejects_fast_growers() {
  //with delta reaching past the next nesting level, the inner squares grow
  //by a factor 2.25 and only the outermost square stays below the variation
  //ceiling
  let img = nested_blob();
  let detector = DetectorBuilder::new_linear_time().set_delta(41).build().unwrap();
  let detection = detector.detect(img.view()).unwrap();

  assert_eq!(detection.len(), 1);
  let region = detection.get(0).unwrap();
  assert_eq!(region.size(), 324);
  assert_eq!(region.level(), 80);
}

#[test]
fn bright_structure_needs_the_inverted_image() {
  let mut img = nd::Array2::<u8>::zeros((40, 40));
  img.slice_mut(nd::s![16..24, 16..24]).fill(255);
  let detector = DetectorBuilder::new_linear_time().build().unwrap();

  //the dark background is far larger than the size ceiling, the bright
  //square is invisible to a sublevel detector
  let detection = detector.detect(img.view()).unwrap();
  assert!(detection.is_empty());

  //inverting the grey scale turns the square into a dark region
  let inverted = detector.invert(img.view());
  let detection = detector.detect(inverted.view()).unwrap();
  assert_eq!(detection.len(), 1);
  let region = detection.get(0).unwrap();
  assert_eq!(region.size(), 64);
  assert_eq!(region.level(), 0);
  assert!((region.center().0 - 19.5).abs() < 1e-9);
  assert!((region.center().1 - 19.5).abs() < 1e-9);
}

#[test]
fn constant_images_have_no_regions() {
  let detector = DetectorBuilder::new_linear_time().build().unwrap();
  for grey in [u8::MIN, 100, u8::MAX] {
    let img = nd::Array2::<u8>::from_elem((16, 16), grey);
    let detection = detector.detect(img.view()).unwrap();
    assert!(detection.is_empty());
    assert_eq!(detection.component_tree().len(), 1);
    assert!(detection.elapsed_time_ms() >= 0.0);
  }
}

#[test]
fn repeated_runs_are_identical() {
  let mut rng = StdRng::seed_from_u64(17);
  let rf = nd::Array2::<u8>::random_using((64, 64), Uniform::new(0, 254), &mut rng);

  for method in [Method::LinearTime, Method::GlobalImmersion] {
    let detector = DetectorBuilder::from_parameters(MserParameters {
      method,
      ..MserParameters::default()
    })
    .build()
    .unwrap();

    let first = detector.detect(rf.view()).unwrap();
    let second = detector.detect(rf.view()).unwrap();

    //same ordered region list down to the component IDs
    assert_eq!(first.mser_indices(), second.mser_indices());
    let ids: Vec<(usize, u8, usize)> =
      first.regions().map(|r| (r.id(), r.level(), r.size())).collect();
    let again: Vec<(usize, u8, usize)> =
      second.regions().map(|r| (r.id(), r.level(), r.size())).collect();
    assert_eq!(ids, again);
  }
}

#[test]
fn methods_agree_on_random_fields() {
  let linear = DetectorBuilder::new_linear_time().build().unwrap();
  let immersion = DetectorBuilder::new_global_immersion().build().unwrap();

  for seed in [11u64, 307, 1234] {
    let mut rng = StdRng::seed_from_u64(seed);
    let rf = nd::Array2::<u8>::random_using((64, 64), Uniform::new(0, 254), &mut rng);

    let a = linear.detect(rf.view()).unwrap();
    let b = immersion.detect(rf.view()).unwrap();

    //region IDs depend on the arena order, the detected regions do not
    assert_eq!(a.len(), b.len());
    let mut pairs_a: Vec<(u8, usize)> = a.regions().map(|r| (r.level(), r.size())).collect();
    let mut pairs_b: Vec<(u8, usize)> = b.regions().map(|r| (r.level(), r.size())).collect();
    pairs_a.sort_unstable();
    pairs_b.sort_unstable();
    assert_eq!(pairs_a, pairs_b);

    let mut var_a: Vec<f32> = a.regions().map(|r| r.variation()).collect();
    let mut var_b: Vec<f32> = b.regions().map(|r| r.variation()).collect();
    var_a.sort_by(|x, y| x.partial_cmp(y).unwrap());
    var_b.sort_by(|x, y| x.partial_cmp(y).unwrap());
    assert_eq!(var_a, var_b);
  }
}

#[test]
fn tree_validation_can_be_switched_on() {
  let img = nested_blob();
  let detector =
    DetectorBuilder::new_global_immersion().set_validate_component_tree(true).build().unwrap();
  let detection = detector.detect(img.view()).unwrap();
  assert_eq!(detection.len(), 3);
}

#[test]
fn builder_rejects_nonsense_parameters() {
  assert!(matches!(
    DetectorBuilder::new_linear_time().set_delta(0).build(),
    Err(MserError::InvalidParameter { param: "delta", .. })
  ));
  assert!(matches!(
    DetectorBuilder::new_linear_time().set_min_diversity(1.5).build(),
    Err(MserError::InvalidParameter { param: "min_diversity", .. })
  ));
  assert!(matches!(
    DetectorBuilder::new_linear_time().set_max_size_variation(f64::NAN).build(),
    Err(MserError::InvalidParameter { param: "max_size_variation", .. })
  ));
  assert!(matches!(
    DetectorBuilder::new_linear_time()
      .set_min_rel_comp_size(0.5)
      .set_max_rel_comp_size(0.25)
      .build(),
    Err(MserError::InvalidParameter { param: "min_rel_comp_size", .. })
  ));
  //the defaults themselves must of course pass
  assert!(DetectorBuilder::from_parameters(MserParameters::default()).build().is_ok());
}

#[test]
fn pre_processor_rescales_and_clamps() {
  let detector = DetectorBuilder::new_linear_time().build().unwrap();

  let arr = nd::arr2(&[
    [1.0f64, 2.0],
    [f64::NAN, f64::INFINITY],
    [f64::NEG_INFINITY, 3.0],
  ]);
  let mapped = detector.pre_processor(arr.view());

  //finite values span the full grey range, specials drown in the background
  assert_eq!(mapped[[0, 0]], 0);
  assert_eq!(mapped[[0, 1]], 128);
  assert_eq!(mapped[[1, 0]], u8::MAX);
  assert_eq!(mapped[[1, 1]], u8::MAX);
  assert_eq!(mapped[[2, 0]], u8::MIN);
  assert_eq!(mapped[[2, 1]], u8::MAX);

  //a constant image has no dynamic range and maps to all-dark
  let flat = nd::Array2::<f32>::from_elem((4, 4), 7.5);
  assert!(detector.pre_processor(flat.view()).iter().all(|&v| v == u8::MIN));

  //integer input works too
  let ints = nd::arr2(&[[0i32, 10], [5, 10]]);
  let mapped = detector.pre_processor(ints.view());
  assert_eq!(mapped[[0, 0]], 0);
  assert_eq!(mapped[[0, 1]], u8::MAX);
  assert_eq!(mapped[[1, 0]], 128);
}

#[test]
fn rectangle_ellipse_is_axis_aligned() {
  //a single dark 24x10 rectangle, wider than it is tall
  let mut img = nd::Array2::<u8>::from_elem((40, 40), 200);
  img.slice_mut(nd::s![15..25, 8..32]).fill(0);

  let detector = DetectorBuilder::new_linear_time().build().unwrap();
  let detection = detector.detect(img.view()).unwrap();
  assert_eq!(detection.len(), 1);

  let region = detection.get(0).unwrap();
  assert_eq!(region.size(), 240);

  //the major axis of the moment ellipse lies along x, with the radii of a
  //uniform a-by-b rectangle: 2*sqrt((a^2 - 1) / 12)
  let ellipse = region.ellipse();
  assert_eq!(ellipse.theta, 0.0);
  assert!((ellipse.xc - 19.5).abs() < 1e-9);
  assert!((ellipse.yc - 19.5).abs() < 1e-9);
  assert!((ellipse.ra - 2.0 * (575.0f64 / 12.0).sqrt()).abs() < 1e-9);
  assert!((ellipse.rb - 2.0 * (99.0f64 / 12.0).sqrt()).abs() < 1e-9);

  //the per-component annotations agree with the fit
  let data = &detection.mser_data()[detection.mser_indices()[0]];
  assert_eq!(data.center(), (19.5, 19.5));
  let cov = data.covariance_matrix();
  assert!((cov[0][0] - 575.0 / 12.0).abs() < 1e-9);
  assert!((cov[1][1] - 99.0 / 12.0).abs() < 1e-9);
  assert_eq!(cov[0][1], 0.0);
}

#[test]
#[cfg(feature = "plots")]
fn detection_stages_render_to_png() {
  use rustronomy_mser::prelude::plots::*;

  let out = std::env::temp_dir().join("rustronomy_mser_test_plots");
  std::fs::create_dir_all(&out).unwrap();

  let img = nested_blob();
  let detector = DetectorBuilder::new_linear_time().build().unwrap();
  let detection = detector.detect(img.view()).unwrap();

  plot_slice(img.view(), &out.join("input.png"), grey_scale).unwrap();
  plot_labels(detection.component_tree().label_map().view(), &out.join("labels.png")).unwrap();
  plot_labels(detection.component_tree().level_slice(80).view(), &out.join("slice80.png")).unwrap();
  plot_ellipses(img.view(), &detection, &out.join("detection.png")).unwrap();

  for file in ["input.png", "labels.png", "slice80.png", "detection.png"] {
    assert!(out.join(file).exists());
  }
}
