pub mod lin_alg;
