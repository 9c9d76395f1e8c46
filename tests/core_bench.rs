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
use rustronomy_mser::prelude::*;

#[test]
fn core_bench() {
  //Create a random uniform distribution
  let rf = nd::Array2::<u8>::random((1024, 1024), Uniform::new(0, 254));

  //Set-up one detector per tree construction method
  let linear = DetectorBuilder::new_linear_time().build().unwrap();
  let immersion = DetectorBuilder::new_global_immersion().build().unwrap();

  println!("Testing 1 to {} threads performance", rayon::current_num_threads());

  //Time with num cores
  let results: Vec<(f64, f64)> = (1..=rayon::current_num_threads())
    .into_iter()
    .map(|num_threads| {
      //Set core count
      println!("Running detection with {num_threads} thread(s)");
      let pool = rayon::ThreadPoolBuilder::new().num_threads(num_threads).build().unwrap();
      //Time both detectors
      let linear_ms = pool.install(|| linear.detect(rf.view()).unwrap().elapsed_time_ms());
      let immersion_ms = pool.install(|| immersion.detect(rf.view()).unwrap().elapsed_time_ms());
      (linear_ms, immersion_ms)
    })
    .collect();

  //Print per run results
  for (threads, (linear_ms, immersion_ms)) in results.iter().enumerate().map(|(i, t)| (i + 1, t)) {
    println!("{threads:02} threads = flooding {linear_ms:000.02}ms; immersion {immersion_ms:000.02}ms");
  }

  //Print total results
  let average = (1.0 / (results.len() as f64)) * results.iter().map(|t| t.0 + t.1).sum::<f64>();
  println!("Average time: {average:.02}ms");
}
