mod keyspan_tests;
