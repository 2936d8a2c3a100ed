mod shm_pair_tests;
